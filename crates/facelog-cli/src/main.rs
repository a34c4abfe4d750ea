use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use facelog_core::{
    AttendanceEntry, AttendanceLedger, EnrollmentForm, Identity, LogOutcome, StopReason,
};
use facelog_hw::Camera;
use std::io::IsTerminal;
use std::process::ExitCode;

mod config;
mod preview;
mod prompt;
mod session;
mod source;

use config::Config;
use session::{EnrollmentSummary, SessionError};

#[derive(Parser)]
#[command(
    name = "facelog",
    version,
    about = "Webcam face enrollment with a daily attendance log"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture face samples for a person and mark them present
    Enroll {
        #[command(flatten)]
        form: FormArgs,
        /// Run without the preview window (no cancel key)
        #[arg(long)]
        no_preview: bool,
    },
    /// Mark a person present without capturing
    Mark {
        #[command(flatten)]
        form: FormArgs,
    },
    /// Print attendance records
    Report {
        /// Only show this day (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// List V4L2 capture devices
    Devices,
}

#[derive(Args)]
struct FormArgs {
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    class: Option<String>,
    /// Roll number
    #[arg(long)]
    roll: Option<String>,
    #[arg(long)]
    section: Option<String>,
    /// Do not prompt for missing fields
    #[arg(long)]
    no_prompt: bool,
}

impl FormArgs {
    fn into_form(self) -> Result<EnrollmentForm> {
        let mut form = EnrollmentForm::new(
            self.name.unwrap_or_default(),
            self.class.unwrap_or_default(),
            self.roll.unwrap_or_default(),
            self.section.unwrap_or_default(),
        );
        let stdin = std::io::stdin();
        if !self.no_prompt && stdin.is_terminal() {
            prompt::fill_missing(&mut form, stdin.lock(), std::io::stdout())
                .context("failed to read form input")?;
        }
        Ok(form)
    }
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll { form, no_preview } => {
            let form = form.into_form()?;
            let config = Config::load()?;
            match session::run_enrollment(&form, &config, !no_preview) {
                Ok(summary) => print_enrollment(&summary),
                Err(SessionError::Form(e)) => return Ok(validation_failed(&e)),
                Err(e) => return Err(e).context("enrollment failed"),
            }
        }
        Commands::Mark { form } => {
            let form = form.into_form()?;
            let config = Config::load()?;
            match session::mark_attendance(&form, &config) {
                Ok((identity, outcome)) => print_attendance(&identity, &outcome),
                Err(SessionError::Form(e)) => return Ok(validation_failed(&e)),
                Err(e) => return Err(e).context("marking attendance failed"),
            }
        }
        Commands::Report { date, json } => {
            let config = Config::load()?;
            let ledger = AttendanceLedger::open(&config.ledger_path);
            let entries = match date {
                Some(day) => ledger.entries_on(day)?,
                None => ledger.entries()?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                match date {
                    Some(day) => println!("No attendance records for {day}"),
                    None => println!("No attendance records"),
                }
            } else {
                print!("{}", format_table(&entries));
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {}  (driver: {}, bus: {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn validation_failed(e: &facelog_core::FormError) -> ExitCode {
    eprintln!("Warning: {e}");
    ExitCode::from(2)
}

fn print_enrollment(summary: &EnrollmentSummary) {
    let report = &summary.report;
    match report.stop {
        StopReason::Completed => {}
        StopReason::Cancelled => println!("Capture stopped early."),
        StopReason::SourceExhausted => println!("Camera stopped delivering frames."),
    }
    if report.samples.is_empty() {
        println!("Warning: no face was detected; saved an empty collection.");
    }
    println!(
        "Captured {} face samples for {} ({} frames processed)",
        report.samples.len(),
        summary.identity,
        report.frames_processed
    );
    println!("Saved to {}", summary.folder.display());
    println!("Collection: {}", summary.collection.display());
    print_attendance(&summary.identity, &summary.attendance);
}

fn print_attendance(identity: &Identity, outcome: &LogOutcome) {
    match outcome {
        LogOutcome::Marked(entry) => println!(
            "Attendance marked for {identity} on {} at {}",
            entry.date,
            entry.time.format("%H:%M:%S")
        ),
        LogOutcome::AlreadyPresent(key) => {
            println!("{identity} is already marked present for {}", key.date)
        }
    }
}

fn format_table(entries: &[AttendanceEntry]) -> String {
    let rows: Vec<[String; 6]> = entries
        .iter()
        .map(|e| {
            [
                e.identity.name.clone(),
                e.identity.class.clone(),
                e.identity.roll_no.clone(),
                e.identity.section.clone(),
                e.date.to_string(),
                e.time.format("%H:%M:%S").to_string(),
            ]
        })
        .collect();

    let header = facelog_core::ledger::HEADER;
    let mut widths = header.map(|h| h.chars().count());
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let mut push_line = |cells: &[&str]| {
        let line: Vec<String> = cells
            .iter()
            .zip(widths)
            .map(|(c, w)| format!("{c:<w$}"))
            .collect();
        out.push_str(line.join("  ").trim_end());
        out.push('\n');
    };
    push_line(&header);
    for row in &rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        push_line(&cells);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn entry(name: &str, date: (i32, u32, u32)) -> AttendanceEntry {
        AttendanceEntry {
            identity: Identity {
                name: name.into(),
                class: "5A".into(),
                roll_no: "12".into(),
                section: "B".into(),
            },
            date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            time: NaiveTime::from_hms_opt(9, 5, 0).unwrap(),
        }
    }

    #[test]
    fn test_table_aligns_columns() {
        let table = format_table(&[
            entry("Alice", (2024, 1, 1)),
            entry("Bartholomew", (2024, 1, 2)),
        ]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Name         Class"));
        assert!(lines[1].starts_with("Alice        5A"));
        assert!(lines[2].ends_with("2024-01-02  09:05:00"));
    }

    #[test]
    fn test_cli_parses_report_date() {
        let cli =
            Cli::try_parse_from(["facelog", "report", "--date", "2024-01-01", "--json"]).unwrap();
        match cli.command {
            Commands::Report { date, json } => {
                assert_eq!(date, NaiveDate::from_ymd_opt(2024, 1, 1));
                assert!(json);
            }
            _ => panic!("expected report"),
        }
    }

    #[test]
    fn test_cli_rejects_bad_date() {
        assert!(Cli::try_parse_from(["facelog", "report", "--date", "yesterday"]).is_err());
    }
}
