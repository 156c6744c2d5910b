use std::env;
use std::io;
use std::io::Write;
use std::process::Command;

fn main() {
    // Use write! as a workaround to avoid https://github.com/rust-lang/rust/issues/46016
    // when piping output to an external program
    let mut stdout = io::stdout();

    let mut output = Command::new("git")
        .args(&["log", "-n1", "--pretty=format:%h", "HEAD"])
        .output()
        .unwrap();
    let mut result = String::from_utf8(output.stdout).unwrap();
    if result.is_empty() {
        result = env::var("BUILDROOT_COMMIT").unwrap_or_default();
        result.truncate(7);
        result = format!("br#{}", result); // add buildroot prefix
    } else if !Command::new("git")
        .args(&["diff", "--quiet"])
        .status()
        .expect("failed to execute process")
        .success()
    {
        result += "-dirty";
    }
    _ = write!(&mut stdout, "cargo:rustc-env=GIT_HASH={}\n", result);

    output = Command::new("git")
        .args(&["log", "-n1", "--pretty=format:%cd", "--date=short", "HEAD"])
        .output()
        .unwrap();
    result = String::from_utf8(output.stdout).unwrap().replace("-", "");
    if result.is_empty() {
        result = env::var("USB_MODED_COMMIT").unwrap_or_default();
        result.truncate(7);
    }
    _ = write!(&mut stdout, "cargo:rustc-env=GIT_DATE={}\n", result);

    output = Command::new("date")
        .args(&["+%Y%m%d_%H%M%S"])
        .output()
        .unwrap();
    result = String::from_utf8(output.stdout).unwrap();
    _ = write!(&mut stdout, "cargo:rustc-env=BUILD_DATE={}\n", result);
}
