/// Returns the conda platform string (subdir) of the running machine, such as
/// `linux-64` or `osx-arm64`.
pub fn current_platform() -> String {
    let os = match std::env::consts::OS {
        "linux" => "linux",
        "macos" => "osx",
        "windows" => "win",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "64",
        "x86" => "32",
        "aarch64" if os == "osx" => "arm64",
        "aarch64" => "aarch64",
        "powerpc64" => "ppc64le",
        other => other,
    };
    format!("{os}-{arch}")
}
