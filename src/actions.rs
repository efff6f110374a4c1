use std::env;
use std::path::Path;
use std::process::Command;

use log::{debug, info, warn};
use tokio::sync::broadcast;

use crate::config::{AwayActions, HereActions};
use crate::messages::{Announcement, DevicePresence};
use crate::mqtt::MqttClient;
use crate::presence::TransitionHandler;
use crate::settings::SharedSettings;

const UNLOCK: &str = "gsettings set org.gnome.desktop.session idle-delay 600; \
    loginctl unlock-session $(loginctl list-sessions --no-legend | cut -f1 -d' ')";
// Soft lock: a 10 second idle delay rather than loginctl lock-session.
const LOCK: &str = "gsettings set org.gnome.desktop.screensaver lock-enabled true; \
    gsettings set org.gnome.desktop.session idle-delay 10; \
    gsettings set org.gnome.desktop.screensaver lock-delay 0";
const MUTE: &str = "amixer set Master mute > /dev/null";
const UNMUTE: &str = "amixer set Master unmute > /dev/null; \
    amixer set Speaker unmute > /dev/null; \
    amixer set Headphone unmute > /dev/null";
const PAUSE_MEDIA: &str = "playerctl pause 2> /dev/null";
const RESUME_MEDIA: &str = "playerctl play 2> /dev/null";

pub trait ShellRunner: Send {
    fn run(&mut self, command: &str);
}

/// Runs commands through `sh -c`, logging failures.
#[derive(Debug, Default)]
pub struct SystemShell;

impl ShellRunner for SystemShell {
    fn run(&mut self, command: &str) {
        debug!("Running <{}>", command);
        match Command::new("sh").arg("-c").arg(command).status() {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("Command <{}> exited with {}", command, status),
            Err(err) => warn!("Unable to run <{}>: {}", command, err),
        }
    }
}

pub fn here_commands(here: &HereActions) -> Vec<&str> {
    let mut commands = Vec::new();
    if here.unlock {
        commands.push(UNLOCK);
    }
    if let Some(command) = here.command.as_deref().filter(|c| !c.trim().is_empty()) {
        commands.push(command);
    }
    if here.resume_media {
        commands.push(RESUME_MEDIA);
    }
    if here.unmute {
        commands.push(UNMUTE);
    }
    commands
}

pub fn away_commands(away: &AwayActions) -> Vec<&str> {
    let mut commands = Vec::new();
    if away.lock {
        commands.push(LOCK);
    }
    if away.mute {
        commands.push(MUTE);
    }
    if away.pause_media {
        commands.push(PAUSE_MEDIA);
    }
    if let Some(command) = away.command.as_deref().filter(|c| !c.trim().is_empty()) {
        commands.push(command);
    }
    commands
}

/// External tools the enabled actions rely on that aren't on `PATH`.
pub fn missing_tools(here: &HereActions, away: &AwayActions) -> Vec<&'static str> {
    let mut needed = Vec::new();
    if here.unlock {
        needed.extend(["gsettings", "loginctl"]);
    }
    if away.lock {
        needed.push("gsettings");
    }
    if here.unmute || away.mute {
        needed.push("amixer");
    }
    if here.resume_media || away.pause_media {
        needed.push("playerctl");
    }
    needed.sort_unstable();
    needed.dedup();
    needed.retain(|tool| !on_path(tool));
    needed
}

fn on_path(tool: &str) -> bool {
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).any(|dir| Path::new(&dir).join(tool).is_file()))
        .unwrap_or(false)
}

/// Turns presence transitions into side effects: shell actions, announcements
/// on the broadcast channel and, when configured, MQTT.
pub struct Dispatcher<R> {
    here: HereActions,
    away: AwayActions,
    shell: R,
    tx: broadcast::Sender<Announcement>,
    mqtt: Option<MqttClient>,
    settings: SharedSettings,
    last_rssi: Option<i8>,
}

impl<R: ShellRunner> Dispatcher<R> {
    pub fn new(
        here: HereActions,
        away: AwayActions,
        shell: R,
        tx: broadcast::Sender<Announcement>,
        settings: SharedSettings,
    ) -> Self {
        Dispatcher {
            here,
            away,
            shell,
            tx,
            mqtt: None,
            settings,
            last_rssi: None,
        }
    }

    pub fn with_mqtt(mut self, client: MqttClient) -> Self {
        self.mqtt = Some(client);
        self
    }

    /// Name and address of the device being watched, as of the current
    /// settings. The address is empty when none is configured.
    fn device(&self) -> (String, String) {
        let params = self.settings.snapshot();
        let address = params.target().map(|a| a.to_string()).unwrap_or_default();
        (params.device_name.clone(), address)
    }

    fn announce(&mut self, presence: DevicePresence) {
        let _ = self.tx.send(Announcement::Presence(presence));
        if let Some(client) = &self.mqtt {
            let (name, address) = self.device();
            if let Err(err) = client.announce_device(&name, &address, presence, self.last_rssi) {
                warn!("Error announcing presence on MQTT: {:?}", err);
            }
        }
    }
}

impl<R: ShellRunner> TransitionHandler for Dispatcher<R> {
    fn on_near(&mut self) {
        info!("Here");
        for command in here_commands(&self.here) {
            self.shell.run(command);
        }
        self.announce(DevicePresence::Present(100));
    }

    fn on_far(&mut self) {
        info!("Away");
        for command in away_commands(&self.away) {
            self.shell.run(command);
        }
        self.announce(DevicePresence::Absent);
    }

    fn on_signal(&mut self, rssi: Option<i8>) {
        self.last_rssi = rssi;
        let _ = self.tx.send(Announcement::Signal(rssi));
    }
}
