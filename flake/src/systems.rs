//! System names ("nix doubles") such as `x86_64-linux`, used as
//! attribute keys to select platform specific outputs.

/// The separator between the CPU and the OS part of a system name.
pub const SEPARATOR: char = '-';

/// Whether `name` looks like a system name.
///
/// Only the presence of the separator is checked; the vocabulary of
/// CPU and OS names is not.
pub fn is_system_name(name: &str) -> bool {
    name.contains(SEPARATOR)
}

/// Maps a Rust target arch/os pair to the nix double cppnix would use
/// for that host.
pub fn nix_double(arch: &str, os: &str) -> String {
    let cpu = match arch {
        "x86" => "i686",
        "arm" => "armv7l",
        "powerpc64" if cfg!(target_endian = "little") => "powerpc64le",
        other => other,
    };
    let os = match os {
        "macos" => "darwin",
        other => other,
    };
    format!("{cpu}{SEPARATOR}{os}")
}

/// The system name of the host this binary runs on.
pub fn current_system() -> String {
    nix_double(std::env::consts::ARCH, std::env::consts::OS)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    #[rstest]
    #[case::x86_64_linux("x86_64", "linux", "x86_64-linux")]
    #[case::aarch64_darwin("aarch64", "macos", "aarch64-darwin")]
    #[case::i686_linux("x86", "linux", "i686-linux")]
    #[case::armv7l_linux("arm", "linux", "armv7l-linux")]
    #[case::riscv64_linux("riscv64", "linux", "riscv64-linux")]
    #[case::x86_64_freebsd("x86_64", "freebsd", "x86_64-freebsd")]
    fn nix_doubles(#[case] arch: &str, #[case] os: &str, #[case] expected: &str) {
        assert_eq!(expected, super::nix_double(arch, os));
    }

    #[rstest]
    #[case::double("x86_64-linux", true)]
    #[case::unknown_but_dashed("foo-bar", true)]
    #[case::no_separator("x86_64", false)]
    #[case::empty("", false)]
    fn system_names(#[case] name: &str, #[case] valid: bool) {
        assert_eq!(valid, super::is_system_name(name));
    }

    #[test]
    fn current_system_is_a_system_name() {
        assert!(super::is_system_name(&super::current_system()));
    }
}
