//! Shell selection for running command strings.

use std::path::Path;

const FALLBACK_SHELL: &str = "/bin/sh";

/// Returns the shell program and the flag that makes it run one command string.
///
/// - Windows: `("cmd", "/C")`
/// - Unix-like: the user's `$SHELL` with `-c`, or `/bin/sh -c`
#[must_use]
pub fn get_shell_command() -> (String, &'static str) {
    if cfg!(windows) {
        ("cmd".into(), "/C")
    } else {
        (unix_shell(std::env::var("SHELL").ok().as_deref()), "-c")
    }
}

/// `$SHELL` when it names an existing absolute path, else `/bin/sh`.
fn unix_shell(from_env: Option<&str>) -> String {
    from_env
        .filter(|shell| {
            let path = Path::new(shell);
            path.is_absolute() && path.is_file()
        })
        .unwrap_or(FALLBACK_SHELL)
        .to_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_unix_shell_falls_back_to_sh() {
        assert_eq!(unix_shell(Some("/bin/sh")), "/bin/sh");
        assert_eq!(unix_shell(Some("sh")), FALLBACK_SHELL);
        assert_eq!(unix_shell(Some("/no/such/shell")), FALLBACK_SHELL);
        assert_eq!(unix_shell(None), FALLBACK_SHELL);
    }

    #[test]
    fn test_shell_command_uses_dash_c() {
        let (_, flag) = get_shell_command();
        assert_eq!(flag, "-c");
    }
}
