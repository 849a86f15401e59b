//! Scripted iptables backend shared by the integration tests.

use hostfw::errors::Result;
use hostfw::iptables::{CommandOutput, IptablesBackend};
use std::sync::{Arc, Mutex};

/// State shared between a test and its [`MockIptables`] backend.
pub struct MockState {
    /// Returned by `save_table`.
    pub save_output: String,
    /// Returned by `list_table`.
    pub list_output: String,
    /// Fail the next N restores on their COMMIT line.
    pub commit_failures: usize,
    /// Fail any restore whose input contains this fragment, at the line
    /// that contains it.
    pub poison: Option<String>,
    /// Every restore input submitted, in order.
    pub restore_inputs: Vec<String>,
}

impl MockState {
    fn respond(&mut self, input: &str) -> CommandOutput {
        self.restore_inputs.push(input.to_owned());
        let lines: Vec<&str> = input.lines().collect();
        if self.commit_failures > 0 {
            self.commit_failures -= 1;
            let commit_line = lines
                .iter()
                .position(|line| *line == "COMMIT")
                .map(|index| index + 1)
                .unwrap_or(lines.len());
            return failed_restore(commit_line);
        }
        if let Some(ref poison) = self.poison {
            if let Some(index) = lines.iter().position(|line| line.contains(poison.as_str())) {
                return failed_restore(index + 1);
            }
        }
        ok_output("iptables-restore", "")
    }
}

/// Cloneable handle; the updater owns one clone, the test another.
#[derive(Clone)]
pub struct MockIptables(pub Arc<Mutex<MockState>>);

impl MockIptables {
    pub fn new() -> MockIptables {
        MockIptables(Arc::new(Mutex::new(MockState {
            save_output: String::new(),
            list_output: String::new(),
            commit_failures: 0,
            poison: None,
            restore_inputs: Vec::new(),
        })))
    }

    pub fn restore_inputs(&self) -> Vec<String> {
        self.0.lock().unwrap().restore_inputs.clone()
    }

    pub fn restore_calls(&self) -> usize {
        self.0.lock().unwrap().restore_inputs.len()
    }

    pub fn set_save_output(&self, output: &str) {
        self.0.lock().unwrap().save_output = output.to_owned();
    }

    pub fn set_list_output(&self, output: &str) {
        self.0.lock().unwrap().list_output = output.to_owned();
    }

    pub fn set_commit_failures(&self, failures: usize) {
        self.0.lock().unwrap().commit_failures = failures;
    }

    pub fn set_poison(&self, fragment: &str) {
        self.0.lock().unwrap().poison = Some(fragment.to_owned());
    }
}

impl IptablesBackend for MockIptables {
    fn restore(&mut self, input: &str) -> Result<CommandOutput> {
        Ok(self.0.lock().unwrap().respond(input))
    }

    fn save_table(&mut self, _table: &str) -> Result<CommandOutput> {
        let stdout = self.0.lock().unwrap().save_output.clone();
        Ok(ok_output("iptables-save", &stdout))
    }

    fn list_table(&mut self, _table: &str) -> Result<CommandOutput> {
        let stdout = self.0.lock().unwrap().list_output.clone();
        Ok(ok_output("iptables", &stdout))
    }
}

fn ok_output(command: &str, stdout: &str) -> CommandOutput {
    CommandOutput {
        command: command.to_owned(),
        code: Some(0),
        stdout: stdout.to_owned(),
        stderr: String::new(),
    }
}

fn failed_restore(line_number: usize) -> CommandOutput {
    CommandOutput {
        command: "iptables-restore".to_owned(),
        code: Some(2),
        stdout: String::new(),
        stderr: format!("iptables-restore: line {} failed", line_number),
    }
}
