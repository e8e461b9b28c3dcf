//! Pipeline: a nonempty ordered sequence of [`Command`]s submitted
//! atomically, with replies returned in the same order, one per command.

use crate::resp::Command;

#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    commands: Vec<Command>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline {
            commands: Vec::new(),
        }
    }

    pub fn add(mut self, cmd: Command) -> Self {
        self.commands.push(cmd);
        self
    }

    pub fn from_commands(commands: Vec<Command>) -> Self {
        Pipeline { commands }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}
