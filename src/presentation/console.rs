//! Line-oriented console front end.
//!
//! Reads commands from stdin and drives the session, the touch surface and
//! the command sender. Status events are printed as they arrive.

use crate::domain::models::{Device, MessageKind, StatusEvent};
use crate::domain::settings::SettingsService;
use crate::domain::touch::TouchSurface;
use crate::infrastructure::session::{CommandSender, SessionManager, StatusSubscription};
use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Connect(Option<Device>),
    Disconnect,
    Touch { channel: usize, x: f64 },
    Move { channel: usize, x: f64 },
    Release(usize),
    Cancel(usize),
    Text(String),
    Value(u32),
    Status,
    Log,
    Help,
    Quit,
}

const HELP: &str = "\
commands:
  connect [address [name]]   open a session (defaults to the last device)
  disconnect                 close the session
  touch <key> <x>            press key 1..N at pixel position x
  move <key> <x>             slide a pressed key
  release <key>              lift a key
  cancel <key>               abort a touch
  text <message>             send a text command
  value <0-100>              send a slider value
  status | log | help | quit";

/// Parse one input line. Keys are 1-based as labelled on the keyboard.
pub fn parse_command(line: &str) -> Result<ConsoleCommand, String> {
    let mut parts = line.split_whitespace();
    let verb = parts.next().ok_or_else(|| "empty command".to_string())?;

    let key = |arg: Option<&str>| -> Result<usize, String> {
        let key: usize = arg
            .ok_or("missing key number")?
            .parse()
            .map_err(|_| "key must be a number".to_string())?;
        key.checked_sub(1).ok_or_else(|| "keys start at 1".to_string())
    };
    let position = |arg: Option<&str>| -> Result<f64, String> {
        arg.ok_or("missing position")?
            .parse()
            .map_err(|_| "position must be a number".to_string())
    };

    let command = match verb.to_lowercase().as_str() {
        "connect" => {
            let device = parts.next().map(|address| {
                let name: Vec<&str> = parts.by_ref().collect();
                let name = if name.is_empty() {
                    address.to_string()
                } else {
                    name.join(" ")
                };
                Device::new(address, name)
            });
            ConsoleCommand::Connect(device)
        }
        "disconnect" => ConsoleCommand::Disconnect,
        "touch" => ConsoleCommand::Touch {
            channel: key(parts.next())?,
            x: position(parts.next())?,
        },
        "move" => ConsoleCommand::Move {
            channel: key(parts.next())?,
            x: position(parts.next())?,
        },
        "release" => ConsoleCommand::Release(key(parts.next())?),
        "cancel" => ConsoleCommand::Cancel(key(parts.next())?),
        "text" => {
            let rest = line.trim_start()[verb.len()..].trim();
            ConsoleCommand::Text(rest.to_string())
        }
        "value" => ConsoleCommand::Value(
            parts
                .next()
                .ok_or("missing value")?
                .parse()
                .map_err(|_| "value must be a whole number".to_string())?,
        ),
        "status" => ConsoleCommand::Status,
        "log" => ConsoleCommand::Log,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(format!("unknown command '{}'", other)),
    };
    Ok(command)
}

pub struct Console {
    manager: SessionManager,
    surface: TouchSurface,
    commands: CommandSender,
    settings: SettingsService,
}

impl Console {
    pub fn new(manager: SessionManager, surface: TouchSurface, settings: SettingsService) -> Self {
        let commands = manager.command_sender();
        Self {
            manager,
            surface,
            commands,
            settings,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        tokio::spawn(print_status(self.manager.subscribe()));
        println!("{}", HELP);

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Ok(ConsoleCommand::Quit) => break,
                Ok(command) => self.execute(command).await,
                Err(e) => println!("! {}", e),
            }
        }

        self.manager.shutdown().await;
        Ok(())
    }

    async fn execute(&mut self, command: ConsoleCommand) {
        let result = match command {
            ConsoleCommand::Connect(device) => {
                let device = device.or_else(|| self.settings.get().last_device.clone());
                match device {
                    Some(device) => self.connect(device).await,
                    None => {
                        println!("! no address given and no previous device");
                        Ok(())
                    }
                }
            }
            ConsoleCommand::Disconnect => {
                self.manager.disconnect().await;
                Ok(())
            }
            ConsoleCommand::Touch { channel, x } => self
                .surface
                .on_touch_begin(channel, x)
                .map_err(anyhow::Error::from),
            ConsoleCommand::Move { channel, x } => self
                .surface
                .on_touch_move(channel, x)
                .map_err(anyhow::Error::from),
            ConsoleCommand::Release(channel) => self
                .surface
                .on_touch_end(channel)
                .map_err(anyhow::Error::from),
            ConsoleCommand::Cancel(channel) => self
                .surface
                .on_touch_cancel(channel)
                .map_err(anyhow::Error::from),
            ConsoleCommand::Text(text) => self
                .commands
                .send_text(&text)
                .await
                .map(|_| ())
                .map_err(anyhow::Error::from),
            ConsoleCommand::Value(value) => self
                .commands
                .send_value(value)
                .await
                .map(|_| ())
                .map_err(anyhow::Error::from),
            ConsoleCommand::Status => {
                self.print_session();
                Ok(())
            }
            ConsoleCommand::Log => {
                self.print_log();
                Ok(())
            }
            ConsoleCommand::Help => {
                println!("{}", HELP);
                Ok(())
            }
            ConsoleCommand::Quit => Ok(()),
        };

        if let Err(e) = result {
            println!("! {}", e);
        }
    }

    async fn connect(&mut self, device: Device) -> Result<()> {
        self.manager.connect(device.clone()).await?;
        if let Err(e) = self.settings.remember_device(&device) {
            warn!("Could not save last device: {}", e);
        }
        Ok(())
    }

    fn print_session(&self) {
        let session = self.manager.session();
        let device = session
            .device
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("state:  {}", session.state);
        println!("device: {}", device);
        println!("keys:   {:?}", self.manager.aggregator().snapshot().values);
        if let Some(at) = session.connected_at {
            println!("up:     {:.1?}", at.elapsed());
        }
        if let Some(at) = session.last_keepalive_at {
            println!("alive:  {:.1?} ago", at.elapsed());
        }
        if let Some(err) = session.last_error {
            println!("error:  {}", err);
        }
    }

    fn print_log(&self) {
        for entry in self.manager.messages() {
            let marker = match entry.kind {
                MessageKind::Sent => ">",
                MessageKind::System => "*",
            };
            println!("{} [{}] {}", marker, entry.timestamp_ms, entry.text);
        }
    }
}

async fn print_status(mut status: StatusSubscription) {
    while let Some(event) = status.recv().await {
        match event {
            StatusEvent::StateChanged { from, to } => println!("~ {} -> {}", from, to),
            StatusEvent::KeepaliveFailed(reason) => println!("~ link lost: {}", reason),
            StatusEvent::WriteFailed(reason) => error!("Write failed: {}", reason),
            StatusEvent::KeepaliveOk | StatusEvent::CommandSent(_) => {}
        }
    }
}
