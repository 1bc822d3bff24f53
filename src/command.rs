//! Builds bridge invocations for the target Linux environment.
//!
//! Every invocation is kept as an explicit program + argument list. The
//! bridge does not exec the words after `--` directly: it joins them and
//! hands the line to the environment's default shell, which parses it again.
//! So every word after `--` is shell-ready, and every data string in it is
//! single-quoted with `'` becoming `'\''`. [`Invocation::render`] applies
//! the same quoting once more to show the host argument list on one line.
//!
//! In [`QuotingMode::Legacy`] the `command` of a run-command operation is
//! spliced into the script verbatim, so it can chain further shell
//! operators by contract. [`QuotingMode::Strict`] additionally refuses data
//! arguments (paths, working directories, script arguments) that carry
//! shell metacharacters or control bytes, even though they would be quoted.

use serde::{Deserialize, Serialize};

const TARGET_SHELL: &str = "bash";
const STRICT_REJECTED: &[char] = &[
    ';', '&', '|', '$', '`', '<', '>', '(', ')', '{', '}', '\'', '"', '\\', '!', '*', '?', '[',
    ']',
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotingMode {
    #[default]
    Legacy,
    Strict,
}

impl QuotingMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" => Some(Self::Legacy),
            "strict" => Some(Self::Strict),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Strict => "strict",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The invocation line, as it would be typed into a POSIX shell.
    pub fn render(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(render_word)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Operation<'a> {
    RunCommand {
        command: &'a str,
        working_directory: &'a str,
    },
    RunScript {
        script_path: &'a str,
        args: &'a [String],
        working_directory: &'a str,
    },
    CreateScript {
        script_path: &'a str,
        content: &'a str,
        executable: bool,
    },
    ListDirectory {
        path: &'a str,
        detailed: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("target environment name must not be empty")]
    EmptyTarget,
    #[error("`{label}` contains characters rejected by strict quoting mode")]
    StrictRejected { label: &'static str },
}

#[derive(Debug, Clone)]
pub struct CommandBuilder {
    bridge_program: String,
    mode: QuotingMode,
}

impl CommandBuilder {
    pub fn new(bridge_program: impl Into<String>, mode: QuotingMode) -> Self {
        Self {
            bridge_program: bridge_program.into(),
            mode,
        }
    }

    /// Builds the invocations for one operation, in execution order.
    /// Only create-script produces more than one.
    pub fn build(
        &self,
        operation: Operation<'_>,
        environment: &str,
    ) -> Result<Vec<Invocation>, BuildError> {
        match operation {
            Operation::RunCommand {
                command,
                working_directory,
            } => {
                self.check_command(command)?;
                self.check_data("workingDirectory", working_directory)?;
                let script = format!("cd {} && {command}", quote_single(working_directory));
                Ok(vec![self.shell(environment, script)?])
            }
            Operation::RunScript {
                script_path,
                args,
                working_directory,
            } => {
                self.check_data("scriptPath", script_path)?;
                self.check_data("workingDirectory", working_directory)?;
                for arg in args {
                    self.check_data("args", arg)?;
                }
                let mut script = format!(
                    "cd {} && {TARGET_SHELL} {}",
                    quote_single(working_directory),
                    quote_single(script_path)
                );
                for arg in args {
                    script.push(' ');
                    script.push_str(&quote_single(arg));
                }
                Ok(vec![self.shell(environment, script)?])
            }
            Operation::CreateScript {
                script_path,
                content,
                executable,
            } => {
                self.check_data("scriptPath", script_path)?;
                let script = format!(
                    "printf '%s\\n' {} > {}",
                    quote_single(content),
                    quote_single(script_path)
                );
                let mut steps = vec![self.shell(environment, script)?];
                if executable {
                    steps.push(self.bridged(
                        environment,
                        vec![
                            "chmod".to_owned(),
                            "+x".to_owned(),
                            quote_single(script_path),
                        ],
                    )?);
                }
                Ok(steps)
            }
            Operation::ListDirectory { path, detailed } => {
                self.check_data("path", path)?;
                let mut words = vec!["ls".to_owned()];
                if detailed {
                    words.push("-la".to_owned());
                }
                words.push(quote_single(path));
                Ok(vec![self.bridged(environment, words)?])
            }
        }
    }

    /// Runs `argv` inside the environment, quoting each word so the
    /// environment's shell sees exactly this argument list.
    pub fn direct(&self, environment: &str, argv: &[&str]) -> Result<Invocation, BuildError> {
        let words = argv.iter().map(|arg| render_word(arg)).collect();
        self.bridged(environment, words)
    }

    fn shell(&self, environment: &str, script: String) -> Result<Invocation, BuildError> {
        let words = vec![
            TARGET_SHELL.to_owned(),
            "-c".to_owned(),
            quote_single(&script),
        ];
        self.bridged(environment, words)
    }

    /// `words` must already be shell-ready.
    fn bridged(&self, environment: &str, words: Vec<String>) -> Result<Invocation, BuildError> {
        let mut args = self.bridge_prefix(environment)?;
        args.extend(words);
        Ok(Invocation::new(self.bridge_program.clone(), args))
    }

    fn bridge_prefix(&self, environment: &str) -> Result<Vec<String>, BuildError> {
        let environment = environment.trim();
        if environment.is_empty() {
            return Err(BuildError::EmptyTarget);
        }
        Ok(vec!["-d".to_owned(), environment.to_owned(), "--".to_owned()])
    }

    fn check_command(&self, command: &str) -> Result<(), BuildError> {
        if self.mode == QuotingMode::Strict
            && command
                .chars()
                .any(|ch| ch.is_control() && ch != '\t' && ch != '\n')
        {
            return Err(BuildError::StrictRejected { label: "command" });
        }
        Ok(())
    }

    fn check_data(&self, label: &'static str, value: &str) -> Result<(), BuildError> {
        if self.mode == QuotingMode::Strict
            && value
                .chars()
                .any(|ch| ch.is_control() || STRICT_REJECTED.contains(&ch))
        {
            return Err(BuildError::StrictRejected { label });
        }
        Ok(())
    }
}

pub fn escape_single_quotes(value: &str) -> String {
    value.replace('\'', "'\\''")
}

pub fn quote_single(value: &str) -> String {
    format!("'{}'", escape_single_quotes(value))
}

fn render_word(word: &str) -> String {
    let inert = !word.is_empty()
        && word.chars().all(|ch| {
            ch.is_ascii_alphanumeric()
                || matches!(ch, '-' | '_' | '.' | '/' | '=' | '+' | ':' | ',' | '@' | '%')
        });
    if inert {
        word.to_owned()
    } else {
        quote_single(word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Undoes POSIX single quoting and backslash escapes outside quotes.
    fn shell_unquote(input: &str) -> String {
        let mut out = String::new();
        let mut chars = input.chars();
        let mut in_single = false;
        while let Some(ch) = chars.next() {
            match (in_single, ch) {
                (true, '\'') => in_single = false,
                (true, other) => out.push(other),
                (false, '\'') => in_single = true,
                (false, '\\') => {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                }
                (false, other) => out.push(other),
            }
        }
        out
    }

    fn legacy() -> CommandBuilder {
        CommandBuilder::new("wsl", QuotingMode::Legacy)
    }

    fn strict() -> CommandBuilder {
        CommandBuilder::new("wsl", QuotingMode::Strict)
    }

    #[test]
    fn escaping_uses_close_escape_reopen_sequence() {
        assert_eq!(escape_single_quotes("it's"), "it'\\''s");
        assert_eq!(quote_single("it's a test"), "'it'\\''s a test'");
    }

    #[test]
    fn quoted_content_round_trips_through_shell_unquoting() {
        for content in ["it's a test", "'", "''", "a'b'c", "$HOME `id` \"x\"", ""] {
            assert_eq!(shell_unquote(&quote_single(content)), content);
        }
    }

    #[test]
    fn quoted_content_round_trips_through_real_shell() {
        let content = "it's a test";
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("printf '%s' {}", quote_single(content)))
            .output()
            .expect("run sh");
        assert_eq!(String::from_utf8_lossy(&output.stdout), content);
    }

    /// Words the environment's shell sees after re-parsing the bridge
    /// arguments that follow `--`, the way the bridge hands them over.
    fn environment_words(invocation: &Invocation) -> Vec<String> {
        let line = invocation.args()[3..].join(" ");
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("for w in {line}; do printf '%s<END>' \"$w\"; done"))
            .output()
            .expect("run sh");
        assert!(output.status.success(), "sh rejected {line}");
        String::from_utf8_lossy(&output.stdout)
            .split("<END>")
            .filter(|word| !word.is_empty())
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn run_command_wraps_cd_and_command_for_bash() {
        let steps = legacy()
            .build(
                Operation::RunCommand {
                    command: "echo hi",
                    working_directory: "/tmp/it's",
                },
                "Ubuntu",
            )
            .expect("build");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].program(), "wsl");
        assert_eq!(&steps[0].args()[..5], &["-d", "Ubuntu", "--", "bash", "-c"]);
        let script = "cd '/tmp/it'\\''s' && echo hi";
        assert_eq!(steps[0].args()[5], quote_single(script));
        assert_eq!(environment_words(&steps[0]), vec!["bash", "-c", script]);
    }

    #[test]
    fn rendered_line_unquotes_back_to_the_argument_list() {
        let steps = legacy()
            .build(
                Operation::RunCommand {
                    command: "echo 'quoted'",
                    working_directory: ".",
                },
                "Ubuntu",
            )
            .expect("build");
        let line = steps[0].render();
        let script = line
            .strip_prefix("wsl -d Ubuntu -- bash -c ")
            .expect("prefix");
        assert_eq!(shell_unquote(script), steps[0].args()[5]);
    }

    #[test]
    fn run_script_quotes_each_positional_argument() {
        let args = vec!["plain".to_owned(), "two words".to_owned(), "it's".to_owned()];
        let steps = legacy()
            .build(
                Operation::RunScript {
                    script_path: "./deploy.sh",
                    args: &args,
                    working_directory: "/srv",
                },
                "Debian",
            )
            .expect("build");
        assert_eq!(
            shell_unquote(&steps[0].args()[5]),
            "cd '/srv' && bash './deploy.sh' 'plain' 'two words' 'it'\\''s'"
        );
    }

    #[test]
    fn create_script_writes_then_marks_executable() {
        let steps = legacy()
            .build(
                Operation::CreateScript {
                    script_path: "/tmp/hello.sh",
                    content: "#!/bin/bash\necho it's ok",
                    executable: true,
                },
                "Ubuntu",
            )
            .expect("build");
        assert_eq!(steps.len(), 2);
        assert_eq!(
            shell_unquote(&steps[0].args()[5]),
            "printf '%s\\n' '#!/bin/bash\necho it'\\''s ok' > '/tmp/hello.sh'"
        );
        assert_eq!(
            steps[1].args(),
            &["-d", "Ubuntu", "--", "chmod", "+x", "'/tmp/hello.sh'"]
        );

        let steps = legacy()
            .build(
                Operation::CreateScript {
                    script_path: "/tmp/hello.sh",
                    content: "echo hi",
                    executable: false,
                },
                "Ubuntu",
            )
            .expect("build");
        assert_eq!(steps.len(), 1);
    }

    #[test]
    fn list_directory_switches_on_detailed_flag() {
        let short = legacy()
            .build(
                Operation::ListDirectory {
                    path: "/",
                    detailed: false,
                },
                "Ubuntu",
            )
            .expect("build");
        assert_eq!(short[0].args(), &["-d", "Ubuntu", "--", "ls", "'/'"]);
        let detailed = legacy()
            .build(
                Operation::ListDirectory {
                    path: "my dir",
                    detailed: true,
                },
                "Ubuntu",
            )
            .expect("build");
        assert_eq!(
            detailed[0].args(),
            &["-d", "Ubuntu", "--", "ls", "-la", "'my dir'"]
        );
    }

    #[test]
    fn hostile_paths_reach_the_environment_as_one_word() {
        let path = "/tmp/a b;id 'q'";
        let listing = legacy()
            .build(
                Operation::ListDirectory {
                    path,
                    detailed: true,
                },
                "Ubuntu",
            )
            .expect("build");
        assert_eq!(environment_words(&listing[0]), vec!["ls", "-la", path]);

        let steps = legacy()
            .build(
                Operation::CreateScript {
                    script_path: path,
                    content: "echo $(id); rm -rf ~",
                    executable: true,
                },
                "Ubuntu",
            )
            .expect("build");
        assert_eq!(
            environment_words(&steps[0]),
            vec![
                "bash",
                "-c",
                "printf '%s\\n' 'echo $(id); rm -rf ~' > '/tmp/a b;id '\\''q'\\'''",
            ]
        );
        assert_eq!(environment_words(&steps[1]), vec!["chmod", "+x", path]);
    }

    #[test]
    fn direct_words_survive_the_environment_shell() {
        let invocation = legacy()
            .direct("Ubuntu", &["echo", "connection test successful"])
            .expect("build");
        assert_eq!(invocation.args()[4], "'connection test successful'");
        assert_eq!(
            environment_words(&invocation),
            vec!["echo", "connection test successful"]
        );
    }

    #[test]
    fn legacy_mode_passes_command_chaining_through() {
        let steps = legacy()
            .build(
                Operation::RunCommand {
                    command: "true; echo injected",
                    working_directory: "'; rm -rf /tmp/x; '",
                },
                "Ubuntu",
            )
            .expect("legacy accepts");
        let script = shell_unquote(&steps[0].args()[5]);
        // The working directory stays a single quoted word.
        assert!(script.starts_with("cd ''\\''; rm -rf /tmp/x; '\\''' && "));
        assert!(script.ends_with("true; echo injected"));
    }

    #[test]
    fn strict_mode_rejects_metacharacters_in_data_arguments() {
        let err = strict()
            .build(
                Operation::RunCommand {
                    command: "ls | wc -l",
                    working_directory: "/tmp; rm -rf ~",
                },
                "Ubuntu",
            )
            .expect_err("strict rejects");
        assert_eq!(
            err,
            BuildError::StrictRejected {
                label: "workingDirectory"
            }
        );

        let args = vec!["$(id)".to_owned()];
        let err = strict()
            .build(
                Operation::RunScript {
                    script_path: "run.sh",
                    args: &args,
                    working_directory: ".",
                },
                "Ubuntu",
            )
            .expect_err("strict rejects");
        assert_eq!(err, BuildError::StrictRejected { label: "args" });

        let err = strict()
            .build(
                Operation::RunCommand {
                    command: "echo \u{0}hidden",
                    working_directory: ".",
                },
                "Ubuntu",
            )
            .expect_err("strict rejects");
        assert_eq!(err, BuildError::StrictRejected { label: "command" });
    }

    #[test]
    fn strict_mode_allows_plain_paths_and_shell_commands() {
        let steps = strict()
            .build(
                Operation::RunCommand {
                    command: "ls -la | grep '.rs'",
                    working_directory: "/home/user/my project",
                },
                "Ubuntu",
            )
            .expect("strict accepts");
        assert_eq!(steps.len(), 1);
    }

    #[test]
    fn empty_target_is_rejected() {
        let err = legacy()
            .build(
                Operation::ListDirectory {
                    path: ".",
                    detailed: false,
                },
                "  ",
            )
            .expect_err("empty target");
        assert_eq!(err, BuildError::EmptyTarget);
    }
}
