//! Text commands from the control channel.
//!
//! Each message is matched against [`COMMANDS`] in order; the first entry
//! whose prefix matches parses and range-checks the payload into a
//! [`Command`]. Only a fully validated command touches the device
//! configuration, so a rejected message never leaves a partial update.

use std::ops::RangeInclusive;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    device::{
        DeviceConfig, DeviceConfigStore, FrontEnd, DDS_AMPLIFICATION_RANGE,
        DEFAULT_EXCITATION_HZ, DIGIPOT_CHANNELS, MUX_RANGE, OFFSET_RANGE, PGA_CHANNELS,
        PGA_LEVELS, SIGNAL_CHAIN_AMPLIFICATION_RANGE,
    },
    error::CommandError,
    monitoring::PipelineMonitor,
};

/// Size of the command characteristic's write buffer
pub const MAX_COMMAND_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    SetExcitationFrequency(u32),
    SetExcitationAmplification(f64),
    SetExcitationOffset(f64),
    SetGain { channel: u8, level: u8 },
    SetPotentiometer { channel: u8, value: u8 },
    SetMux(u8),
    SetSignalChainOffset(f64),
    SetSignalChainAmplification(f64),
    StartExcitation,
    StopExcitation,
    PowerOn,
    PowerOff,
    StartStreaming,
    RestoreDefaults,
}

/// How a table entry recognizes its messages
#[derive(Debug, Clone, Copy)]
pub enum Pattern {
    /// Message starts with this text; the parser gets the rest
    Literal(&'static str),
    /// Letter, one channel digit, then `:`. The parser gets everything after
    /// the letter, e.g. `"1:7"` for `P1:7`.
    Indexed(u8),
}

impl Pattern {
    fn strip<'a>(&self, msg: &'a str) -> Option<&'a str> {
        match *self {
            Pattern::Literal(prefix) => msg.strip_prefix(prefix),
            Pattern::Indexed(letter) => {
                let bytes = msg.as_bytes();
                (bytes.len() >= 3 && bytes[0] == letter && bytes[2] == b':').then(|| &msg[1..])
            }
        }
    }
}

pub struct CommandEntry {
    pub name: &'static str,
    pub pattern: Pattern,
    pub parse: fn(&str) -> Result<Command, CommandError>,
}

/// Dispatch table. Order matters: the first match wins.
pub static COMMANDS: &[CommandEntry] = &[
    CommandEntry {
        name: "SDDS",
        pattern: Pattern::Literal("SDDS:"),
        parse: |p: &str| parse_num("SDDS", p).map(Command::SetExcitationFrequency),
    },
    CommandEntry {
        name: "DDSA",
        pattern: Pattern::Literal("DDSA:"),
        parse: |p: &str| {
            parse_in("DDSA", p, DDS_AMPLIFICATION_RANGE).map(Command::SetExcitationAmplification)
        },
    },
    CommandEntry {
        name: "DDSO",
        pattern: Pattern::Literal("DDSO:"),
        parse: |p: &str| parse_in("DDSO", p, OFFSET_RANGE).map(Command::SetExcitationOffset),
    },
    CommandEntry {
        name: "P",
        pattern: Pattern::Indexed(b'P'),
        parse: |p: &str| {
            let (channel, level) = parse_indexed("P", p, PGA_CHANNELS, PGA_LEVELS)?;
            Ok(Command::SetGain { channel, level })
        },
    },
    CommandEntry {
        name: "D",
        pattern: Pattern::Indexed(b'D'),
        parse: |p: &str| {
            let (channel, value) = parse_indexed("D", p, DIGIPOT_CHANNELS, 0..=255)?;
            Ok(Command::SetPotentiometer { channel, value })
        },
    },
    CommandEntry {
        name: "M",
        pattern: Pattern::Literal("M:"),
        parse: parse_mux,
    },
    CommandEntry {
        name: "SCO",
        pattern: Pattern::Literal("SCO:"),
        parse: |p: &str| parse_in("SCO", p, OFFSET_RANGE).map(Command::SetSignalChainOffset),
    },
    CommandEntry {
        name: "SCA",
        pattern: Pattern::Literal("SCA:"),
        parse: |p: &str| {
            parse_in("SCA", p, SIGNAL_CHAIN_AMPLIFICATION_RANGE)
                .map(Command::SetSignalChainAmplification)
        },
    },
    CommandEntry {
        name: "IDDS",
        pattern: Pattern::Literal("IDDS"),
        parse: |_: &str| Ok(Command::StartExcitation),
    },
    CommandEntry {
        name: "DDSOFF",
        pattern: Pattern::Literal("DDSOFF"),
        parse: |_: &str| Ok(Command::StopExcitation),
    },
    CommandEntry {
        name: "DEFAULTS",
        pattern: Pattern::Literal("DEFAULTS"),
        parse: |_: &str| Ok(Command::RestoreDefaults),
    },
    CommandEntry {
        name: "ON",
        pattern: Pattern::Literal("ON"),
        parse: |_: &str| Ok(Command::PowerOn),
    },
    CommandEntry {
        name: "START",
        pattern: Pattern::Literal("START"),
        parse: |_: &str| Ok(Command::StartStreaming),
    },
    CommandEntry {
        name: "OFF",
        pattern: Pattern::Literal("OFF"),
        parse: |_: &str| Ok(Command::PowerOff),
    },
];

fn parse_num<N: FromStr>(command: &'static str, payload: &str) -> Result<N, CommandError> {
    payload
        .trim()
        .parse()
        .map_err(|_| CommandError::Malformed {
            command,
            payload: payload.to_owned(),
        })
}

fn parse_in(
    command: &'static str,
    payload: &str,
    range: RangeInclusive<f64>,
) -> Result<f64, CommandError> {
    let value: f64 = parse_num(command, payload)?;
    if !range.contains(&value) {
        return Err(CommandError::OutOfRange {
            command,
            value,
            min: *range.start(),
            max: *range.end(),
        });
    }
    Ok(value)
}

fn check_u8(
    command: &'static str,
    value: i64,
    range: &RangeInclusive<u8>,
) -> Result<u8, CommandError> {
    match u8::try_from(value) {
        Ok(v) if range.contains(&v) => Ok(v),
        _ => Err(CommandError::OutOfRange {
            command,
            value: value as f64,
            min: f64::from(*range.start()),
            max: f64::from(*range.end()),
        }),
    }
}

/// `"<digit>:<int>"` into a range-checked (channel, value) pair
fn parse_indexed(
    command: &'static str,
    payload: &str,
    channels: RangeInclusive<u8>,
    values: RangeInclusive<u8>,
) -> Result<(u8, u8), CommandError> {
    let malformed = || CommandError::Malformed {
        command,
        payload: payload.to_owned(),
    };
    let (channel, value) = payload.split_once(':').ok_or_else(malformed)?;
    let channel = channel
        .parse::<u8>()
        .ok()
        .filter(|_| channel.len() == 1)
        .ok_or_else(malformed)?;
    let channel = check_u8(command, i64::from(channel), &channels)?;
    let value = check_u8(command, parse_num(command, value)?, &values)?;
    Ok((channel, value))
}

/// Exactly one decimal digit
fn parse_mux(payload: &str) -> Result<Command, CommandError> {
    match payload.as_bytes() {
        [d] if d.is_ascii_digit() => {
            check_u8("M", i64::from(d - b'0'), &MUX_RANGE).map(Command::SetMux)
        }
        _ => Err(CommandError::Malformed {
            command: "M",
            payload: payload.to_owned(),
        }),
    }
}

/// Strip the framing leftovers the desktop client and terminals append
fn trim_message(raw: &[u8]) -> &[u8] {
    let end = raw
        .iter()
        .rposition(|&b| !matches!(b, b'\0' | b'\r' | b'\n' | b' '))
        .map_or(0, |i| i + 1);
    &raw[..end]
}

/// Classify one message. `Ok(None)` means no entry matched.
pub fn parse(raw: &[u8]) -> Result<Option<Command>, CommandError> {
    let msg = trim_message(raw);
    if msg.len() > MAX_COMMAND_LEN {
        return Err(CommandError::TooLong {
            len: msg.len(),
            max: MAX_COMMAND_LEN,
        });
    }
    let Ok(msg) = std::str::from_utf8(msg) else {
        return Ok(None);
    };
    for entry in COMMANDS {
        if let Some(payload) = entry.pattern.strip(msg) {
            return (entry.parse)(payload).map(Some);
        }
    }
    Ok(None)
}

/// What [`CommandDispatcher::on_command_received`] did with a message
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Applied(Command),
    Rejected(CommandError),
    Ignored,
}

/// Applies validated commands to the shared store and the peripherals
pub struct CommandDispatcher<F> {
    store: Arc<DeviceConfigStore>,
    front_end: F,
    monitor: Arc<PipelineMonitor>,
}

impl<F: FrontEnd> CommandDispatcher<F> {
    pub fn new(store: Arc<DeviceConfigStore>, front_end: F, monitor: Arc<PipelineMonitor>) -> Self {
        Self {
            store,
            front_end,
            monitor,
        }
    }

    pub fn store(&self) -> &Arc<DeviceConfigStore> {
        &self.store
    }

    pub fn front_end(&self) -> &F {
        &self.front_end
    }

    /// Entry point for one length-delimited message from the control channel
    pub fn on_command_received(&mut self, raw: &[u8]) -> Dispatch {
        match parse(raw) {
            Ok(Some(cmd)) => {
                self.apply(cmd);
                self.monitor.command_applied();
                Dispatch::Applied(cmd)
            }
            Ok(None) => {
                self.monitor.command_ignored();
                debug!(msg = %String::from_utf8_lossy(raw), "Unrecognized command ignored");
                Dispatch::Ignored
            }
            Err(e) => {
                self.monitor.command_rejected();
                warn!(%e, "Command rejected");
                Dispatch::Rejected(e)
            }
        }
    }

    /// Reset mux, excitation and signal chain to firmware defaults and push
    /// them to the hardware. Gain and potentiometer settings are kept.
    pub fn restore_defaults(&mut self) {
        let restored = self.store.update(|cfg| {
            *cfg = DeviceConfig {
                pga: cfg.pga,
                digipot: cfg.digipot,
                ..DeviceConfig::default()
            };
            *cfg
        });
        self.front_end.apply_baseline(&restored);
        info!("Default settings applied");
    }

    fn apply(&mut self, cmd: Command) {
        let fe = &mut self.front_end;
        match cmd {
            Command::SetExcitationFrequency(hz) => {
                self.store.update(|c| c.excitation_hz = hz);
                fe.apply_excitation_frequency(hz);
                info!(hz, "Excitation frequency set");
            }
            Command::SetExcitationAmplification(gain) => {
                self.store.update(|c| c.excitation_amplification = gain);
                fe.apply_excitation_amplification(gain);
                info!(gain, "DDS amplification set");
            }
            Command::SetExcitationOffset(volts) => {
                self.store.update(|c| c.excitation_offset = volts);
                fe.apply_excitation_offset(volts);
                info!(volts, "DDS offset set");
            }
            Command::SetGain { channel, level } => {
                self.store.update(|c| c.pga[usize::from(channel - 1)] = level);
                fe.apply_gain_channel(channel, level);
                info!(channel, level, "PGA set");
            }
            Command::SetPotentiometer { channel, value } => {
                self.store.update(|c| c.digipot[usize::from(channel)] = value);
                fe.apply_potentiometer_channel(channel, value);
                info!(channel, value, "Digipot set");
            }
            Command::SetMux(sel) => {
                self.store.update(|c| c.mux = sel);
                fe.apply_mux(sel);
                info!(sel, "Mux set");
            }
            Command::SetSignalChainOffset(volts) => {
                self.store.update(|c| c.signal_chain_offset = volts);
                fe.apply_signal_chain_offset(volts);
                info!(volts, "Signal chain offset set");
            }
            Command::SetSignalChainAmplification(gain) => {
                self.store.update(|c| c.signal_chain_amplification = gain);
                fe.apply_signal_chain_amplification(gain);
                info!(gain, "Signal chain amplification set");
            }
            Command::StartExcitation => {
                self.store.update(|c| {
                    c.excitation_hz = DEFAULT_EXCITATION_HZ;
                    c.excitation_running = true;
                });
                fe.start_excitation(DEFAULT_EXCITATION_HZ);
                info!("Starting DDS output");
            }
            Command::StopExcitation => {
                self.store.update(|c| c.excitation_running = false);
                fe.stop_excitation();
                info!("Stopping DDS output");
            }
            Command::PowerOn => {
                info!("Powering up the system");
                fe.power_up();
                self.store.set_power_on(true);
            }
            Command::PowerOff => {
                info!("Powering down the system");
                fe.power_down();
                self.store.set_power_on(false);
            }
            Command::StartStreaming => {
                self.store.arm_streaming();
                info!("Streaming armed");
            }
            Command::RestoreDefaults => self.restore_defaults(),
        }
    }
}
