//! Shell hooks
//!
//! The hook scripts are embedded at compile time. For a session they are
//! written into a private directory and wired into the shell's startup so
//! the user's own rc files still run first:
//!
//! - bash: `--rcfile` pointing at a file that sources `~/.bashrc`, then the
//!   hook
//! - zsh: a generated `ZDOTDIR` whose startup files source the user's, then
//!   the hook
//!
//! Other shells run without hooks.

use std::fmt;
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const BASH_HOOK: &str = include_str!("bash.sh");
pub const ZSH_HOOK: &str = include_str!("zsh.sh");

/// Carries the caller's `ZDOTDIR` through the generated one
const USER_ZDOTDIR_VAR: &str = "DEVTRACE_USER_ZDOTDIR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Bash,
    Zsh,
}

impl ShellKind {
    /// Recognize a shell from its program path (`/usr/bin/zsh`, `-bash`, ...)
    pub fn detect(program: &str) -> Option<Self> {
        let name = Path::new(program).file_name()?.to_str()?;
        name.trim_start_matches('-').parse().ok()
    }

    pub fn name(&self) -> &'static str {
        match self {
            ShellKind::Bash => "bash",
            ShellKind::Zsh => "zsh",
        }
    }

    pub fn script(&self) -> &'static str {
        match self {
            ShellKind::Bash => BASH_HOOK,
            ShellKind::Zsh => ZSH_HOOK,
        }
    }
}

impl FromStr for ShellKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bash" => Ok(ShellKind::Bash),
            "zsh" => Ok(ShellKind::Zsh),
            other => Err(format!("unsupported shell '{other}' (expected bash or zsh)")),
        }
    }
}

impl fmt::Display for ShellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Hook files generated for one session, plus what the spawn needs to load
/// them. The files are removed on drop.
#[derive(Debug)]
pub struct HookInstall {
    kind: ShellKind,
    dir: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl HookInstall {
    pub fn kind(&self) -> ShellKind {
        self.kind
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Arguments to place before the user's shell arguments
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Extra environment for the shell
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }
}

impl Drop for HookInstall {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!(dir = %self.dir.display(), "Hook files removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.dir.display(), error = %e, "Failed to remove hook files"),
        }
    }
}

/// Generate hook files for `program` under `base`. Returns `Ok(None)` for
/// shells without hook support.
pub fn prepare(program: &str, base: &Path, session_id: Uuid) -> io::Result<Option<HookInstall>> {
    let Some(kind) = ShellKind::detect(program) else {
        info!(program, "No hooks for this shell, commands will not be recorded");
        return Ok(None);
    };

    let dir = base.join(format!(
        "devtrace-hooks-{}-{}",
        std::process::id(),
        session_id.simple()
    ));
    DirBuilder::new().recursive(true).mode(0o700).create(&dir)?;

    // Constructed before writing so a failure below still cleans up.
    let mut install = HookInstall {
        kind,
        dir,
        args: Vec::new(),
        env: Vec::new(),
    };

    match kind {
        ShellKind::Bash => {
            let rcfile = install.dir.join("bashrc");
            fs::write(&rcfile, bash_rcfile())?;
            install.args = vec!["--rcfile".to_string(), rcfile.to_string_lossy().into_owned()];
        }
        ShellKind::Zsh => {
            write_zdotdir(&install.dir)?;
            install.env.push((
                "ZDOTDIR".to_string(),
                install.dir.to_string_lossy().into_owned(),
            ));
            if let Some(user_zdotdir) = std::env::var_os("ZDOTDIR") {
                install.env.push((
                    USER_ZDOTDIR_VAR.to_string(),
                    user_zdotdir.to_string_lossy().into_owned(),
                ));
            }
        }
    }

    debug!(shell = %kind, dir = %install.dir.display(), "Hook files written");
    Ok(Some(install))
}

fn bash_rcfile() -> String {
    format!(
        "if [ -f \"$HOME/.bashrc\" ]; then . \"$HOME/.bashrc\"; fi\n\n{BASH_HOOK}"
    )
}

fn write_zdotdir(dir: &Path) -> io::Result<()> {
    let own = shell_quote(&dir.to_string_lossy());
    let hook = dir.join("devtrace.zsh");
    fs::write(&hook, ZSH_HOOK)?;

    let user = format!("\"${{{USER_ZDOTDIR_VAR}:-$HOME}}\"");
    let source_user = |file: &str| {
        format!(
            "ZDOTDIR={user}\n[[ -f \"$ZDOTDIR/{file}\" ]] && source \"$ZDOTDIR/{file}\"\n"
        )
    };

    fs::write(
        dir.join(".zshenv"),
        format!("{}ZDOTDIR={own}\n", source_user(".zshenv")),
    )?;
    fs::write(
        dir.join(".zprofile"),
        format!("{}ZDOTDIR={own}\n", source_user(".zprofile")),
    )?;
    fs::write(
        dir.join(".zshrc"),
        format!(
            "{}if [[ -n \"${{{USER_ZDOTDIR_VAR}-}}\" ]]; then\n    ZDOTDIR=\"${USER_ZDOTDIR_VAR}\"\nelse\n    unset ZDOTDIR\nfi\nunset {USER_ZDOTDIR_VAR}\nsource {}\n",
            source_user(".zshrc"),
            shell_quote(&hook.to_string_lossy()),
        ),
    )?;
    Ok(())
}

/// Single-quote `s` for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_detect_shell() {
        assert_eq!(ShellKind::detect("/bin/bash"), Some(ShellKind::Bash));
        assert_eq!(ShellKind::detect("-zsh"), Some(ShellKind::Zsh));
        assert_eq!(ShellKind::detect("/usr/local/bin/zsh"), Some(ShellKind::Zsh));
        assert_eq!(ShellKind::detect("/bin/sh"), None);
        assert_eq!(ShellKind::detect("fish"), None);
    }

    #[test]
    fn test_scripts_guard_on_pipe_variable() {
        for kind in [ShellKind::Bash, ShellKind::Zsh] {
            let script = kind.script();
            assert!(script.contains("DEVTRACE_EVENT_PIPE"), "{kind}");
            assert!(script.contains("-p "), "{kind}");
            assert!(script.contains("%0A"), "{kind}");
        }
    }

    #[test]
    fn test_prepare_bash() {
        let dir = tempfile::tempdir().unwrap();
        let install = prepare("/bin/bash", dir.path(), Uuid::new_v4())
            .unwrap()
            .unwrap();

        assert_eq!(install.args()[0], "--rcfile");
        let rcfile = PathBuf::from(&install.args()[1]);
        let content = fs::read_to_string(&rcfile).unwrap();
        assert!(content.starts_with("if [ -f \"$HOME/.bashrc\" ]"));
        assert!(content.contains("trap '__devtrace_preexec' DEBUG"));

        let hook_dir = install.dir().to_path_buf();
        drop(install);
        assert!(!hook_dir.exists());
    }

    #[test]
    fn test_prepare_zsh() {
        let dir = tempfile::tempdir().unwrap();
        let install = prepare("zsh", dir.path(), Uuid::new_v4()).unwrap().unwrap();

        let zdotdir = install
            .env()
            .iter()
            .find(|(key, _)| key == "ZDOTDIR")
            .map(|(_, value)| PathBuf::from(value))
            .unwrap();
        assert_eq!(zdotdir, install.dir());
        for file in [".zshenv", ".zprofile", ".zshrc", "devtrace.zsh"] {
            assert!(zdotdir.join(file).is_file(), "{file}");
        }
        let zshrc = fs::read_to_string(zdotdir.join(".zshrc")).unwrap();
        assert!(zshrc.contains("devtrace.zsh"));
    }

    #[test]
    fn test_unsupported_shell_gets_no_hooks() {
        let dir = tempfile::tempdir().unwrap();
        assert!(prepare("/bin/sh", dir.path(), Uuid::new_v4())
            .unwrap()
            .is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp/a b"), "'/tmp/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
