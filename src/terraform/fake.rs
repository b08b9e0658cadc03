//! Scripted stand-in for the terraform binary.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use super::runner::{CommandOutput, TerraformRunner};
use crate::cloud::ProviderError;

#[derive(Default)]
pub struct FakeRunner {
    scripted: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
    calls: Mutex<Vec<(PathBuf, Vec<String>)>>,
    destroyed: Mutex<HashSet<PathBuf>>,
}

impl FakeRunner {
    /// Queue an output for the next call of `command`.
    pub fn script(&self, command: &str, output: CommandOutput) {
        self.scripted
            .lock()
            .unwrap()
            .entry(command.to_string())
            .or_default()
            .push_back(output);
    }

    /// First argument of every call, in order.
    pub fn commands(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, args)| args[0].clone())
            .collect()
    }

    fn default_output(&self, workdir: &Path, args: &[&str]) -> CommandOutput {
        let ok = |stdout: &str| CommandOutput {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        };
        match args[0] {
            "plan" if args.iter().any(|a| a.starts_with("-out=")) => CommandOutput {
                exit_code: 2,
                stdout: "Plan: 1 to add, 0 to change, 0 to destroy.".into(),
                stderr: String::new(),
            },
            "plan" => ok("No changes. Your infrastructure matches the configuration."),
            "output" => ok(r#"{"endpoint":{"sensitive":false,"type":"string","value":"10.0.0.1"}}"#),
            "destroy" => {
                self.destroyed.lock().unwrap().insert(workdir.to_path_buf());
                ok("Destroy complete! Resources: 1 destroyed.")
            }
            "state" if self.destroyed.lock().unwrap().contains(workdir) => ok(""),
            "state" => ok("null_resource.web\n"),
            _ => ok(""),
        }
    }
}

#[async_trait]
impl TerraformRunner for FakeRunner {
    async fn run(&self, workdir: &Path, args: &[&str]) -> Result<CommandOutput, ProviderError> {
        self.calls.lock().unwrap().push((
            workdir.to_path_buf(),
            args.iter().map(|a| a.to_string()).collect(),
        ));
        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(args[0])
            .and_then(VecDeque::pop_front);
        Ok(scripted.unwrap_or_else(|| self.default_output(workdir, args)))
    }
}
