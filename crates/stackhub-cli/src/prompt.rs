use dialoguer::{Input, Password};
use indicatif::ProgressBar;
use stackhub_core::{looks_secret, Prompter};
use stackhub_schema::FlatParameter;
use std::io::{stdin, IsTerminal};

/// Asks the operator for `user` parameters that have no value.
///
/// Secret-looking names are read without echo. A running spinner is
/// suspended while the prompt is shown.
pub struct TerminalPrompter {
    progress: Option<ProgressBar>,
}

impl TerminalPrompter {
    pub fn new(progress: Option<ProgressBar>) -> Self {
        Self { progress }
    }

    fn ask_now(parameter: &FlatParameter) -> Result<String, String> {
        if !stdin().is_terminal() {
            return Err("stdin is not a terminal".to_owned());
        }
        let label = parameter.qualified_name();
        let answer = if looks_secret(&label) {
            Password::new().with_prompt(&label).interact()
        } else {
            Input::<String>::new().with_prompt(&label).interact_text()
        };
        answer.map_err(|e| format!("prompt failed: {e}"))
    }
}

impl Prompter for TerminalPrompter {
    fn ask(&self, parameter: &FlatParameter) -> Result<String, String> {
        match &self.progress {
            Some(pb) => pb.suspend(|| Self::ask_now(parameter)),
            None => Self::ask_now(parameter),
        }
    }
}
