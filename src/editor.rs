//! Interactive console editor for the binding file
//!
//! Line oriented: each command edits the slot list, re-validates the whole
//! set and saves it. The running engine picks the file up through the hot
//! reloader, so the editor never touches the engine directly.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::backend::InputBackend;
use crate::slots::{BindingSet, SlotError};

const HELP: &str = "\
commands:
  list                               show all slots
  add <trigger> <output> <ms> [pass] append a slot
  set <n> <field> <value>            fields: trigger output interval pass enabled window method
  enable <n> | disable <n>           toggle a slot
  remove <n>                         delete a slot
  help                               this text
  quit                               stop the daemon";

#[derive(Debug, thiserror::Error)]
pub enum EditError {
    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("unknown command '{0}', try 'help'")]
    UnknownCommand(String),

    #[error("no slot {0}")]
    NoSuchSlot(usize),

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("expected on/off, got '{0}'")]
    NotASwitch(String),

    #[error("expected hardware or message, got '{0}'")]
    NotAMethod(String),

    #[error("at least one slot is required")]
    LastSlot,

    #[error(transparent)]
    Slot(#[from] SlotError),
}

/// A parsed editor command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Add {
        trigger: String,
        output: String,
        interval: String,
        pass_through: bool,
    },
    Set {
        slot: usize,
        field: Field,
        value: String,
    },
    Enable(usize),
    Disable(usize),
    Remove(usize),
    Help,
    Quit,
}

/// Slot field addressable by `set`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Trigger,
    Output,
    Interval,
    Pass,
    Enabled,
    Window,
    Method,
}

impl std::str::FromStr for Field {
    type Err = EditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trigger" => Ok(Field::Trigger),
            "output" => Ok(Field::Output),
            "interval" => Ok(Field::Interval),
            "pass" => Ok(Field::Pass),
            "enabled" => Ok(Field::Enabled),
            "window" => Ok(Field::Window),
            "method" => Ok(Field::Method),
            other => Err(EditError::UnknownField(other.to_string())),
        }
    }
}

fn parse_switch(s: &str) -> Result<bool, EditError> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(EditError::NotASwitch(s.to_string())),
    }
}

fn parse_index(s: Option<&str>, usage: &'static str) -> Result<usize, EditError> {
    s.and_then(|s| s.parse().ok()).ok_or(EditError::Usage(usage))
}

impl Command {
    /// Parse one input line; `None` for a blank line
    pub fn parse(line: &str) -> Result<Option<Self>, EditError> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };

        let command = match verb.to_lowercase().as_str() {
            "list" | "ls" => Command::List,
            "add" => {
                const USAGE: &str = "add <trigger> <output> <ms> [pass]";
                let (Some(trigger), Some(output), Some(interval)) =
                    (words.next(), words.next(), words.next())
                else {
                    return Err(EditError::Usage(USAGE));
                };
                let pass_through = match words.next() {
                    None => false,
                    Some("pass") => true,
                    Some(other) => parse_switch(other)?,
                };
                Command::Add {
                    trigger: trigger.to_string(),
                    output: output.to_string(),
                    interval: interval.to_string(),
                    pass_through,
                }
            }
            "set" => {
                const USAGE: &str = "set <n> <field> <value>";
                let slot = parse_index(words.next(), USAGE)?;
                let field = words.next().ok_or(EditError::Usage(USAGE))?.parse()?;
                let value = words.collect::<Vec<_>>().join(" ");
                if value.is_empty() && field != Field::Window {
                    return Err(EditError::Usage(USAGE));
                }
                Command::Set { slot, field, value }
            }
            "enable" => Command::Enable(parse_index(words.next(), "enable <n>")?),
            "disable" => Command::Disable(parse_index(words.next(), "disable <n>")?),
            "remove" | "rm" => Command::Remove(parse_index(words.next(), "remove <n>")?),
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => return Err(EditError::UnknownCommand(other.to_string())),
        };
        Ok(Some(command))
    }
}

/// How an editor session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorExit {
    Quit,
    EndOfInput,
}

pub struct Editor {
    path: PathBuf,
    backend: Arc<dyn InputBackend>,
    set: BindingSet,
}

impl Editor {
    pub fn new(path: PathBuf, backend: Arc<dyn InputBackend>, set: BindingSet) -> Self {
        Self { path, backend, set }
    }

    pub fn bindings(&self) -> &BindingSet {
        &self.set
    }

    /// Read commands until `quit` or end of input
    pub fn run(&mut self, input: impl BufRead, mut out: impl Write) -> io::Result<EditorExit> {
        writeln!(out, "{}", self.set.summary())?;
        writeln!(out, "type 'help' for commands")?;
        for line in input.lines() {
            let line = line?;
            match Command::parse(&line) {
                Ok(None) => continue,
                Ok(Some(Command::Quit)) => {
                    info!("editor quit");
                    return Ok(EditorExit::Quit);
                }
                Ok(Some(command)) => match self.execute(command) {
                    Ok(reply) => writeln!(out, "{}", reply)?,
                    Err(e) => {
                        debug!(%e, "edit rejected");
                        writeln!(out, "error: {}", e)?;
                    }
                },
                Err(e) => writeln!(out, "error: {}", e)?,
            }
            out.flush()?;
        }
        Ok(EditorExit::EndOfInput)
    }

    /// Apply one command and return the text to show
    pub fn execute(&mut self, command: Command) -> Result<String, EditError> {
        self.refresh();
        let mut records = self.records()?;
        match command {
            Command::List => return Ok(self.listing()),
            Command::Help => return Ok(HELP.to_string()),
            Command::Quit => return Ok(String::new()),
            Command::Add {
                trigger,
                output,
                interval,
                pass_through,
            } => records.push(json!({
                "triggerKey": trigger,
                "outputKey": output,
                "intervalMs": interval,
                "passThrough": pass_through,
                "enabled": true,
            })),
            Command::Set { slot, field, value } => {
                let record = Self::record_mut(&mut records, slot)?;
                let (key, value) = match field {
                    Field::Trigger => ("triggerKey", Value::String(value)),
                    Field::Output => ("outputKey", Value::String(value)),
                    Field::Interval => ("intervalMs", Value::String(value)),
                    Field::Pass => ("passThrough", Value::Bool(parse_switch(&value)?)),
                    Field::Enabled => ("enabled", Value::Bool(parse_switch(&value)?)),
                    Field::Window => {
                        let title = match value.trim() {
                            "-" | "none" => String::new(),
                            title => title.to_string(),
                        };
                        ("windowTitle", Value::String(title))
                    }
                    Field::Method => {
                        let hardware = match value.trim().to_lowercase().as_str() {
                            "hardware" => true,
                            "message" => false,
                            _ => return Err(EditError::NotAMethod(value)),
                        };
                        ("useSendInput", Value::Bool(hardware))
                    }
                };
                record[key] = value;
            }
            Command::Enable(slot) => Self::record_mut(&mut records, slot)?["enabled"] = json!(true),
            Command::Disable(slot) => Self::record_mut(&mut records, slot)?["enabled"] = json!(false),
            Command::Remove(slot) => {
                Self::record_mut(&mut records, slot)?;
                if records.len() == 1 {
                    return Err(EditError::LastSlot);
                }
                records.remove(slot - 1);
            }
        }
        self.commit(records)
    }

    /// Pick up changes made to the file outside the editor
    fn refresh(&mut self) {
        match BindingSet::load(&self.path, self.backend.as_ref()) {
            Ok(set) => self.set = set,
            Err(e) => warn!(%e, "binding file invalid, editing the last saved bindings"),
        }
    }

    fn records(&self) -> Result<Vec<Value>, EditError> {
        self.set
            .slots()
            .iter()
            .map(|slot| serde_json::to_value(slot.to_record()).map_err(|e| EditError::Slot(e.into())))
            .collect()
    }

    fn record_mut(records: &mut [Value], slot: usize) -> Result<&mut Value, EditError> {
        slot.checked_sub(1)
            .and_then(|i| records.get_mut(i))
            .ok_or(EditError::NoSuchSlot(slot))
    }

    /// Validate the edited list as a whole, then save it
    fn commit(&mut self, records: Vec<Value>) -> Result<String, EditError> {
        let document = json!({ "slots": records, "language": self.set.language() });
        let set = BindingSet::from_value(&document, self.backend.as_ref())?;
        set.save(&self.path)?;
        info!(path = ?self.path, slots = set.slots().len(), "bindings saved");

        let mut reply = format!("saved. {}", set.summary());
        for conflict in set.conflicts() {
            warn!(trigger = %conflict.trigger, kept = %conflict.kept, skipped = %conflict.skipped, "duplicate trigger");
            reply.push_str(&format!(
                "\nwarning: trigger '{}' is used by {} and {}; {} will be skipped",
                conflict.trigger, conflict.kept, conflict.skipped, conflict.skipped
            ));
        }
        self.set = set;
        Ok(reply)
    }

    fn listing(&self) -> String {
        let mut text = self.set.summary();
        for (i, slot) in self.set.slots().iter().enumerate() {
            text.push_str(&format!("\n  {}. {}", i + 1, slot.describe()));
        }
        text
    }
}
