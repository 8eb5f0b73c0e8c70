//! Inspect command implementation.

use crate::core::time::{unix_ns_from_lut, CITRUSLEAF_EPOCH_MS};
use crate::rw::policy::{Pickle, PickleKind};
use crate::truncate::TruncateLog;
use crate::wire::RwMessage;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::fmt::Write as _;
use std::path::PathBuf;

/// Decode peer messages and truncate logs.
#[derive(Args, Debug)]
pub struct InspectArgs {
    #[command(subcommand)]
    pub command: InspectCommand,
}

/// Inspect subcommands.
#[derive(Subcommand, Debug)]
pub enum InspectCommand {
    /// Decode a hex-encoded peer message.
    Message {
        /// Frame bytes as hex. Whitespace is ignored.
        hex: String,
    },
    /// Print the entries of a truncate log.
    TruncateLog {
        /// Path to truncate.json.
        path: PathBuf,
    },
}

/// Run the inspect command.
pub fn run_inspect(args: InspectArgs) -> Result<()> {
    let out = match args.command {
        InspectCommand::Message { hex } => describe_message(&hex)?,
        InspectCommand::TruncateLog { path } => describe_truncate_log(&path)?,
    };
    print!("{}", out);
    Ok(())
}

fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    let digits: String = hex.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        anyhow::bail!("odd number of hex digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex at offset {}", i))
        })
        .collect()
}

fn describe_message(hex: &str) -> Result<String> {
    let frame = decode_hex(hex)?;
    let msg = RwMessage::decode(&frame).context("failed to decode message")?;

    let mut out = String::new();
    writeln!(out, "op:         {:?}", msg.op)?;
    if let Some(result) = msg.result {
        writeln!(out, "result:     {}", result)?;
    }
    if let Some(ref namespace) = msg.namespace {
        writeln!(out, "namespace:  {}", namespace)?;
    }
    if let Some(ns_index) = msg.ns_index {
        writeln!(out, "ns_index:   {}", ns_index)?;
    }
    if let Some(digest) = msg.digest {
        writeln!(out, "digest:     {}", digest)?;
    }
    if let Some(tid) = msg.tid {
        writeln!(out, "tid:        {}", tid)?;
    }
    if let Some(generation) = msg.generation {
        writeln!(out, "generation: {}", generation)?;
    }
    if let Some(lut) = msg.last_update_time {
        writeln!(out, "lut:        {} (unix ms {})", lut, lut + CITRUSLEAF_EPOCH_MS)?;
    }
    if let Some(regime) = msg.regime {
        writeln!(out, "regime:     {}", regime)?;
    }
    if !msg.info.is_empty() {
        writeln!(out, "info:       {:?}", msg.info)?;
    }
    if let Some(ref bytes) = msg.record {
        match Pickle::decode(bytes) {
            Ok(pickle) => describe_pickle(&mut out, &pickle)?,
            Err(e) => writeln!(out, "record:     {} bytes (undecodable: {})", bytes.len(), e)?,
        }
    }
    Ok(out)
}

fn describe_pickle(out: &mut String, pickle: &Pickle) -> Result<()> {
    let kind = match pickle.kind {
        PickleKind::Full => "full".to_string(),
        PickleKind::Drop => "drop".to_string(),
        PickleKind::Delta { base, ref removed } => match base {
            Some((generation, lut)) => format!(
                "delta on gen {} lut {} ({} removed)",
                generation,
                lut,
                removed.len()
            ),
            None => format!("delta on new record ({} removed)", removed.len()),
        },
    };
    writeln!(out, "record:     {}", kind)?;
    writeln!(
        out,
        "  meta:     gen {} lut {} void {}",
        pickle.meta.generation, pickle.meta.last_update_time, pickle.meta.void_time
    )?;
    if let Some(ref set) = pickle.set_name {
        writeln!(out, "  set:      {}", set)?;
    }
    for bin in &pickle.bins {
        match bin.particle {
            Some(ref particle) => writeln!(out, "  bin {:<15} {:?} (lut {})", bin.name, particle, bin.lut)?,
            None => writeln!(out, "  bin {:<15} <deleted> (lut {})", bin.name, bin.lut)?,
        }
    }
    Ok(())
}

fn describe_truncate_log(path: &std::path::Path) -> Result<String> {
    let entries = TruncateLog::read_file(path)
        .with_context(|| format!("failed to read truncate log {:?}", path))?;

    let mut out = String::new();
    writeln!(out, "{} entries", entries.len())?;
    for entry in entries {
        let lut = entry.hval.lut();
        writeln!(
            out,
            "{}{}{} lut={} unix_ns={}{}",
            entry.namespace,
            if entry.set.is_some() { ":" } else { "" },
            entry.set.as_deref().unwrap_or(""),
            lut,
            unix_ns_from_lut(lut),
            if entry.hval.is_cenotaph() { " cenotaph" } else { "" }
        )?;
    }
    Ok(out)
}
