//! Simulator command line.
//!
//! The simulator is configured entirely through `-e <directive>` arguments
//! executed in order at startup: load the platform script, expose the board
//! UART as a PTY-backed terminal at the device path, and connect the two.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Setup directives that wire the simulated UART to a host PTY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UartSetup {
    /// Platform script, without the leading `@`.
    pub platform_script: String,
    /// Simulator-side name of the PTY terminal.
    pub terminal_name: String,
    /// Peripheral path of the board UART.
    pub uart: String,
    /// Host path where the simulator creates the PTY link.
    pub device_path: PathBuf,
    /// Additional directives, executed after the built-in ones.
    pub extra_directives: Vec<String>,
}

impl UartSetup {
    /// Directives in execution order.
    pub fn directives(&self) -> Vec<String> {
        let mut out = vec![
            format!("s @{}", self.platform_script),
            format!(
                "emulation CreateUartPtyTerminal \"{}\" \"{}\"",
                self.terminal_name,
                self.device_path.display()
            ),
            format!("connector Connect {} {}", self.uart, self.terminal_name),
        ];
        out.extend(self.extra_directives.iter().cloned());
        out
    }
}

/// A fully resolved simulator invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorCommand {
    executable: PathBuf,
    args: Vec<OsString>,
    working_dir: PathBuf,
}

impl SimulatorCommand {
    /// Invocation of `executable` with no arguments, run from `working_dir`.
    pub fn new(executable: impl Into<PathBuf>, working_dir: impl AsRef<Path>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: working_dir.as_ref().to_path_buf(),
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Simulator invocation that runs every directive of `setup` via `-e`.
    pub fn with_uart(
        executable: impl Into<PathBuf>,
        working_dir: impl AsRef<Path>,
        setup: &UartSetup,
    ) -> Self {
        setup
            .directives()
            .into_iter()
            .fold(Self::new(executable, working_dir), |cmd, directive| {
                cmd.arg("-e").arg(directive)
            })
    }

    /// Directory the simulator runs from.
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Arguments after the executable.
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Shell-quoted command line, for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(self.executable.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(|part| shell_quote(&part.to_string_lossy()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// A [`Command`] with program, arguments and working directory set.
    /// Stdio and pre-exec hooks are left to the caller.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.args(&self.args).current_dir(&self.working_dir);
        cmd
    }
}

/// Quote `s` for a POSIX shell if it contains anything beyond a safe set.
fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@' | '=' | ','));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arty_setup() -> UartSetup {
        UartSetup {
            platform_script: "digilent_arty.resc".to_string(),
            terminal_name: "term".to_string(),
            uart: "sysbus.uart".to_string(),
            device_path: PathBuf::from("/proj/uart.pty"),
            extra_directives: vec!["start".to_string()],
        }
    }

    #[test]
    fn test_directive_order() {
        assert_eq!(
            arty_setup().directives(),
            vec![
                "s @digilent_arty.resc".to_string(),
                "emulation CreateUartPtyTerminal \"term\" \"/proj/uart.pty\"".to_string(),
                "connector Connect sysbus.uart term".to_string(),
                "start".to_string(),
            ]
        );
    }

    #[test]
    fn test_each_directive_gets_its_own_flag() {
        let cmd = SimulatorCommand::with_uart("/cfu/renode", "/proj/build/renode", &arty_setup());
        let args: Vec<String> = cmd
            .args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(args.len(), 8);
        assert!(args.iter().step_by(2).all(|a| a == "-e"));
        assert_eq!(args[1], "s @digilent_arty.resc");
        assert_eq!(cmd.working_dir(), Path::new("/proj/build/renode"));
    }

    #[test]
    fn test_display_quotes_only_when_needed() {
        let cmd = SimulatorCommand::new("/opt/renode", "/tmp")
            .arg("-e")
            .arg("s @arty.resc")
            .arg("it's");
        assert_eq!(cmd.display(), r"/opt/renode -e 's @arty.resc' 'it'\''s'");
    }

    #[test]
    fn test_shell_quote_empty() {
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_to_command_sets_cwd() {
        let cmd = SimulatorCommand::new("renode", "/work").arg("--console");
        let command = cmd.to_command();
        assert_eq!(command.get_program(), "renode");
        assert_eq!(command.get_current_dir(), Some(Path::new("/work")));
        assert_eq!(command.get_args().collect::<Vec<_>>(), vec!["--console"]);
    }
}
