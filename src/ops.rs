use std::cell::Cell;
use std::path::Path;
use std::process::Command;

use anyhow::{Result, anyhow};
use colored::*;
use comfy_table::{Attribute, Cell as TableCell, ContentArrangement, Table, presets::UTF8_FULL};
use shadowspawn::writer::selector::should_add;
use shadowspawn::writer::{ComponentType, Writer};
use shadowspawn::{OutputWriter, SnapshotRequest, Threshold, Verbosity};

use crate::config::settings::Settings;

/// Sink that prints to the terminal in the same style as the rest of the CLI.
pub fn console_output(level: Verbosity) -> OutputWriter {
    OutputWriter::new(level, |message: &str, threshold: Threshold| match threshold {
        Threshold::Always | Threshold::UnlessSilent => {
            eprintln!("{} {}", "!".yellow().bold(), message.yellow())
        }
        Threshold::Normal => println!("{} {}", "i".cyan().bold(), message),
        Threshold::IfVerbose => println!("  {}", message.dimmed()),
    })
}

/// Runs `command` against a shadow copy of `source` mounted at `device`.
///
/// Returns the child's exit code, or the session's status code when the session failed.
pub fn do_run(settings: &Settings, source: &Path, device: &str, command: &[String]) -> Result<i32> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("no command given"))?;

    let out = console_output(settings.verbosity);
    let (mut service, mapper) = shadowspawn::platform()?;
    let request = SnapshotRequest {
        source: source.to_path_buf(),
        device: device.to_string(),
        simulate: settings.simulate,
        wait_timeout: settings.wait_timeout(),
    };

    let exit_code = Cell::new(0);
    let result = shadowspawn::create_snapshot_and_run(&request, service.as_mut(), mapper.as_ref(), &out, || {
        out.write_line(format!("Launching command: {}", command.join(" ")), Threshold::Normal);
        let status = Command::new(program).args(args).status()?;
        exit_code.set(status.code().unwrap_or(1));
        Ok(())
    });

    match result {
        Ok(()) => {
            if exit_code.get() != 0 {
                out.write_line(
                    format!("Command exited with code {}", exit_code.get()),
                    Threshold::UnlessSilent,
                );
            }
            Ok(exit_code.get())
        }
        // Already reported through the sink.
        Err(err) => Ok(err.code()),
    }
}

pub fn do_writers(settings: &Settings, json: bool) -> Result<()> {
    let out = console_output(settings.verbosity);
    let (mut service, _mapper) = shadowspawn::platform()?;
    let writers = shadowspawn::list_writers(service.as_mut(), &out, settings.wait_timeout())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&writers)?);
        return Ok(());
    }

    if writers.is_empty() {
        println!("{} {}", "i".yellow().bold(), "No writers registered".yellow());
        return Ok(());
    }
    println!("{}", writer_table(&writers));
    Ok(())
}

fn writer_table(writers: &[Writer]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            TableCell::new("Writer").add_attribute(Attribute::Bold),
            TableCell::new("Component").add_attribute(Attribute::Bold),
            TableCell::new("Logical path").add_attribute(Attribute::Bold),
            TableCell::new("Type").add_attribute(Attribute::Bold),
            TableCell::new("Selectable").add_attribute(Attribute::Bold),
            TableCell::new("Parent").add_attribute(Attribute::Bold),
            TableCell::new("Added").add_attribute(Attribute::Bold),
        ]);

    for writer in writers {
        for (i, c) in writer.components.iter().enumerate() {
            let kind = match c.component_type {
                ComponentType::Database => "database",
                ComponentType::FileGroup => "filegroup",
                ComponentType::Undefined => "undefined",
            };
            table.add_row(vec![
                TableCell::new(&writer.name),
                TableCell::new(&c.name),
                TableCell::new(&c.logical_path),
                TableCell::new(kind),
                TableCell::new(if c.selectable_for_backup { "yes" } else { "no" }),
                TableCell::new(writer.parent_of(i).map(|p| p.name.as_str()).unwrap_or("-")),
                TableCell::new(if should_add(c) { "yes" } else { "no" }),
            ]);
        }
    }
    table
}

pub fn do_version() {
    println!("{} {}", "shadowspawn".bold(), env!("CARGO_PKG_VERSION").cyan());
}
