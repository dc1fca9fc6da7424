//! # CLI Module
//!
//! The interactive front end: reads a line with history, splits it like a shell would and
//! turns it into a [`Status`].

use dialoguer::{BasicHistory, Input};
use tracing::{error, warn};

use super::{ClearTarget, DebuggerUI, Status};
use crate::errors::Result;
use crate::feedback::Feedback;

const PROMPT: &str = "tdb";
const HISTORY_SIZE: usize = 256;

pub struct CliUi {
    history: BasicHistory,
}

impl CliUi {
    #[must_use]
    pub fn build() -> Self {
        CliUi {
            history: BasicHistory::new()
                .max_entries(HISTORY_SIZE)
                .no_duplicates(true),
        }
    }

    /// Reads one line, `None` at the end of the input
    fn get_line(&mut self) -> Result<Option<String>> {
        let res: std::result::Result<String, dialoguer::Error> = Input::new()
            .with_prompt(PROMPT)
            .allow_empty(true)
            .history_with(&mut self.history)
            .interact_text();
        match res {
            Ok(line) => Ok(Some(line)),
            Err(dialoguer::Error::IO(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Ok(None)
            }
            Err(e) => Err(std::io::Error::other(e.to_string()).into()),
        }
    }
}

impl Default for CliUi {
    fn default() -> Self {
        Self::build()
    }
}

impl DebuggerUI for CliUi {
    fn process(&mut self, feedback: Feedback) -> Result<Status> {
        if let Feedback::Error(e) = &feedback {
            error!("{e}");
        }
        print!("{feedback}");

        loop {
            let Some(line) = self.get_line()? else {
                return Ok(Status::DebuggerQuit);
            };
            if let Some(status) = parse_command(&line) {
                return Ok(status);
            }
        }
    }
}

/// Parses one line of operator input
///
/// Returns `None` for a blank line. Anything that is not a well formed command becomes
/// [`Status::Unsupported`].
#[must_use]
pub fn parse_command(line: &str) -> Option<Status> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let unsupported = || Status::Unsupported(trimmed.to_string());
    let Some(words) = shlex::split(trimmed) else {
        warn!("unbalanced quotes in {trimmed:?}");
        return Some(unsupported());
    };
    let args: Vec<&str> = words.iter().map(String::as_str).collect();

    let status = match args.as_slice() {
        ["b" | "break", target] => match split_location(target) {
            Some((file, line)) => Status::SetBreakpoint { file, line },
            None => Status::SetFunctionBreakpoint((*target).to_string()),
        },
        ["f" | "find", location] => match split_location(location) {
            Some((file, line)) => Status::Find { file, line },
            None => unsupported(),
        },
        ["bc" | "bclear", "all"] => Status::ClearBreakpoint(ClearTarget::All),
        ["bc" | "bclear", index] => match index.parse() {
            Ok(n) => Status::ClearBreakpoint(ClearTarget::Index(n)),
            Err(_) => unsupported(),
        },
        ["bl"] => Status::ListBreakpoints { all: false },
        ["bl", "all"] => Status::ListBreakpoints { all: true },
        ["bt"] => Status::Backtrace,
        ["c" | "continue"] => Status::Continue,
        ["s" | "step"] => Status::Step,
        ["n" | "next"] => Status::Next,
        ["si" | "stepi"] => Status::StepInstruction,
        ["l" | "list"] => Status::List {
            location: None,
            range: None,
        },
        ["l" | "list", location] => match split_location(location) {
            Some(loc) => Status::List {
                location: Some(loc),
                range: None,
            },
            None => unsupported(),
        },
        ["l" | "list", location, range] => match (split_location(location), range.parse()) {
            (Some(loc), Ok(range)) => Status::List {
                location: Some(loc),
                range: Some(range),
            },
            _ => unsupported(),
        },
        ["r" | "restart"] => Status::Restart,
        ["disass"] => Status::Disassemble,
        ["p" | "print", var] => Status::Print((*var).to_string()),
        ["regs"] => Status::DumpRegisters,
        ["h" | "help"] => Status::Help,
        ["q" | "quit"] => Status::DebuggerQuit,
        _ => unsupported(),
    };
    Some(status)
}

/// Splits `file:line`, the file part may itself contain colons
fn split_location(s: &str) -> Option<(String, u64)> {
    let (file, line) = s.rsplit_once(':')?;
    if file.is_empty() {
        return None;
    }
    Some((file.to_string(), line.parse().ok()?))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_breakpoint_commands() {
        assert_eq!(
            parse_command("b main.go:4"),
            Some(Status::SetBreakpoint {
                file: "main.go".to_string(),
                line: 4
            })
        );
        assert_eq!(
            parse_command("  break   /tmp/a:b/x.c:12 "),
            Some(Status::SetBreakpoint {
                file: "/tmp/a:b/x.c".to_string(),
                line: 12
            })
        );
        assert_eq!(
            parse_command("b main.main"),
            Some(Status::SetFunctionBreakpoint("main.main".to_string()))
        );
        assert_eq!(
            parse_command("f main.go:7"),
            Some(Status::Find {
                file: "main.go".to_string(),
                line: 7
            })
        );
        assert_eq!(
            parse_command("find main.go"),
            Some(Status::Unsupported("find main.go".to_string()))
        );
        assert_eq!(
            parse_command("bc 1"),
            Some(Status::ClearBreakpoint(ClearTarget::Index(1)))
        );
        assert_eq!(
            parse_command("bclear all"),
            Some(Status::ClearBreakpoint(ClearTarget::All))
        );
        assert_eq!(
            parse_command("bl all"),
            Some(Status::ListBreakpoints { all: true })
        );
        assert_eq!(
            parse_command("bc one"),
            Some(Status::Unsupported("bc one".to_string()))
        );
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(
            parse_command("l"),
            Some(Status::List {
                location: None,
                range: None
            })
        );
        assert_eq!(
            parse_command("list main.go:6 3"),
            Some(Status::List {
                location: Some(("main.go".to_string(), 6)),
                range: Some(3)
            })
        );
        assert_eq!(
            parse_command("l main.go"),
            Some(Status::Unsupported("l main.go".to_string()))
        );
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("   "), None);
        assert_eq!(parse_command("c"), Some(Status::Continue));
        assert_eq!(parse_command("next"), Some(Status::Next));
        assert_eq!(parse_command("s"), Some(Status::Step));
        assert_eq!(parse_command("stepi"), Some(Status::StepInstruction));
        assert_eq!(parse_command("bt"), Some(Status::Backtrace));
        assert_eq!(parse_command("r"), Some(Status::Restart));
        assert_eq!(parse_command("disass"), Some(Status::Disassemble));
        assert_eq!(parse_command("p i"), Some(Status::Print("i".to_string())));
        assert_eq!(parse_command("q"), Some(Status::DebuggerQuit));
        assert_eq!(
            parse_command("frobnicate 3"),
            Some(Status::Unsupported("frobnicate 3".to_string()))
        );
        assert_eq!(
            parse_command("p \"unterminated"),
            Some(Status::Unsupported("p \"unterminated".to_string()))
        );
    }
}
