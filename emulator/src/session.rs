use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use droidboot_core::fastboot::Engine;
use droidboot_core::partition::PartitionTable;
use droidboot_core::power::LowPowerFlag;
use droidboot_core::progress::{ProgressObserver, RecordedProgress};
use droidboot_core::provision::{ProvisionConfig, Provisioner};
use droidboot_core::sim::{ScriptedTransport, SimPlatform};

pub const DEFAULT_DOWNLOAD_CAPACITY: usize = 16 << 20;

pub const HELP_TOPICS: &[(&str, &str)] = &[
    (
        "fastboot",
        "<command>                    - send a raw fastboot packet (getvar:version, erase:data, ...)",
    ),
    (
        "download",
        "download <path>              - stage a host file through download:",
    ),
    (
        "power",
        "power <low|ok>               - drive the low-power admission flag",
    ),
    (
        "status",
        "status                       - display engine and simulated device state",
    ),
    (
        "help",
        "help [topic]                 - show help for a command",
    ),
];

type SimEngine = Engine<Provisioner<SimPlatform>, Arc<LowPowerFlag>>;

pub struct Session {
    engine: SimEngine,
    provisioner: Provisioner<SimPlatform>,
    low_power: Arc<LowPowerFlag>,
    transport: ScriptedTransport,
    progress: ProgressObserver<RecordedProgress>,
    transcript: Option<TranscriptLogger>,
    started_at: Instant,
}

impl Session {
    pub fn new(download_capacity: usize, transcript: Option<&Path>) -> io::Result<Self> {
        let transcript = transcript.map(TranscriptLogger::new).transpose()?;
        let low_power = Arc::new(LowPowerFlag::new());
        let mut engine = Engine::new(download_capacity, Arc::clone(&low_power));
        let mut provisioner = Provisioner::new(
            SimPlatform::new(),
            PartitionTable::default(),
            ProvisionConfig::default(),
        );
        provisioner.install(&mut engine);

        Ok(Self {
            engine,
            provisioner,
            low_power,
            transport: ScriptedTransport::new(),
            progress: ProgressObserver(RecordedProgress::default()),
            transcript,
            started_at: Instant::now(),
        })
    }

    pub fn platform(&self) -> &SimPlatform {
        self.provisioner.platform()
    }

    pub fn handle_command(&mut self, line: &str) -> io::Result<Vec<String>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        let elapsed = self.started_at.elapsed();
        self.append(elapsed, TranscriptRole::Host, trimmed)?;

        let lines = if trimmed.eq_ignore_ascii_case("help") {
            help_lines(None)
        } else if let Some(topic) = trimmed.strip_prefix("help ") {
            help_lines(Some(topic.trim()))
        } else if trimmed.eq_ignore_ascii_case("status") {
            self.status_lines()
        } else if let Some(level) = trimmed.strip_prefix("power ") {
            self.handle_power(level.trim())
        } else if let Some(path) = trimmed.strip_prefix("download ") {
            self.handle_download(Path::new(path.trim()))
        } else {
            self.transport.push(trimmed.as_bytes());
            self.run_session()
        };

        self.record_output(elapsed, &lines)?;
        Ok(lines)
    }

    fn handle_power(&mut self, level: &str) -> Vec<String> {
        match level {
            "low" => self.low_power.set(true),
            "ok" => self.low_power.set(false),
            other => return vec![format!("ERR power level `{other}` (expected low|ok)")],
        }
        vec![format!("power {level}")]
    }

    fn handle_download(&mut self, path: &Path) -> Vec<String> {
        let payload = match fs::read(path) {
            Ok(payload) => payload,
            Err(err) => return vec![format!("ERR {}: {err}", path.display())],
        };
        if payload.len() > self.engine.download().capacity() {
            // Only the command goes out so the refusal is not followed by
            // the payload being parsed as a command.
            self.transport
                .push(format!("download:{:08x}", payload.len()).as_bytes());
        } else {
            self.transport.push_download(&payload);
        }
        self.run_session()
    }

    fn run_session(&mut self) -> Vec<String> {
        let _ = self.engine.run_session(
            &mut self.transport,
            &mut self.provisioner,
            &mut self.progress,
        );
        self.transport.take_replies()
    }

    fn status_lines(&self) -> Vec<String> {
        let platform = self.provisioner.platform();
        let markers: String = self
            .progress
            .0
            .markers()
            .iter()
            .map(|marker| char::from(marker.as_byte()))
            .collect();
        vec![
            format!("session: {:?}", self.engine.state()),
            format!(
                "download: {} / {} bytes staged",
                self.engine.download().staged_length(),
                self.engine.download().capacity()
            ),
            format!(
                "power: {}",
                if self.low_power.is_low() { "low" } else { "ok" }
            ),
            format!("variables: {}", self.engine.variables().len()),
            format!("commands run: {}", platform.commands().len()),
            format!("restarts: {:?}", platform.power().restarts()),
            format!("power offs: {}", platform.power().power_offs()),
            format!("progress: {markers}"),
        ]
    }

    fn append(&mut self, elapsed: Duration, role: TranscriptRole, line: &str) -> io::Result<()> {
        match self.transcript.as_mut() {
            Some(transcript) => transcript.append_line(elapsed, role, line),
            None => Ok(()),
        }
    }

    fn record_output(&mut self, elapsed: Duration, lines: &[String]) -> io::Result<()> {
        for line in lines {
            self.append(elapsed, TranscriptRole::Device, line)?;
        }
        Ok(())
    }
}

fn help_lines(topic: Option<&str>) -> Vec<String> {
    match topic {
        None => HELP_TOPICS
            .iter()
            .map(|(_, usage)| (*usage).to_string())
            .collect(),
        Some(topic) => match HELP_TOPICS.iter().find(|(name, _)| *name == topic) {
            Some((_, usage)) => vec![(*usage).to_string()],
            None => vec![format!(
                "ERR unknown help topic `{topic}` (topics: {})",
                help_topic_list()
            )],
        },
    }
}

fn help_topic_list() -> String {
    HELP_TOPICS
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ")
}

struct TranscriptLogger {
    writer: BufWriter<fs::File>,
}

impl TranscriptLogger {
    fn new(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut logger = Self {
            writer: BufWriter::new(file),
        };
        logger.write_header()?;
        Ok(logger)
    }

    fn write_header(&mut self) -> io::Result<()> {
        writeln!(self.writer, "# droidboot emulator transcript")?;
        writeln!(
            self.writer,
            "# Timestamps are milliseconds since session start"
        )?;
        writeln!(self.writer)?;
        self.writer.flush()
    }

    fn append_line(
        &mut self,
        elapsed: Duration,
        role: TranscriptRole,
        line: &str,
    ) -> io::Result<()> {
        writeln!(
            self.writer,
            "[+{:>6} ms] {} {}",
            elapsed.as_millis(),
            role.prefix(),
            line
        )?;
        self.writer.flush()
    }
}

#[derive(Clone, Copy)]
enum TranscriptRole {
    Host,
    Device,
}

impl TranscriptRole {
    fn prefix(self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Device => "DEV <",
        }
    }
}
