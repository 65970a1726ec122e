//! Target platform tags used by the secondary registry (`linux-x64`, ...).

/// Build for every platform (pure JS extensions).
pub const UNIVERSAL: &str = "universal";

/// Tag of the machine the daemon runs on, if the registry knows it.
pub fn current_platform() -> Option<&'static str> {
    let tag = if cfg!(all(target_os = "windows", target_arch = "x86_64")) {
        "win32-x64"
    } else if cfg!(all(target_os = "windows", target_arch = "aarch64")) {
        "win32-arm64"
    } else if cfg!(all(target_os = "linux", target_arch = "x86_64", target_env = "musl")) {
        "alpine-x64"
    } else if cfg!(all(target_os = "linux", target_arch = "aarch64", target_env = "musl")) {
        "alpine-arm64"
    } else if cfg!(all(target_os = "linux", target_arch = "x86_64")) {
        "linux-x64"
    } else if cfg!(all(target_os = "linux", target_arch = "aarch64")) {
        "linux-arm64"
    } else if cfg!(all(target_os = "linux", target_arch = "arm")) {
        "linux-armhf"
    } else if cfg!(all(target_os = "macos", target_arch = "x86_64")) {
        "darwin-x64"
    } else if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        "darwin-arm64"
    } else {
        return None;
    };
    Some(tag)
}

/// Acceptable build tags for `platform`, most specific first.
pub fn candidates(platform: &str) -> Vec<String> {
    // alpine 은 linux 빌드로 대체하지 않는다 (musl/glibc)
    vec![platform.to_string(), UNIVERSAL.to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_platform_shape() {
        if let Some(tag) = current_platform() {
            let (os, arch) = tag.split_once('-').unwrap();
            assert!(["win32", "linux", "alpine", "darwin"].contains(&os));
            assert!(!arch.is_empty());
        }
    }

    #[test]
    fn test_candidates_fall_back_to_universal() {
        assert_eq!(candidates("linux-arm64"), vec!["linux-arm64", "universal"]);
    }
}
