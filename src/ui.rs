//! Interface de terminal do gbatch: barra de progresso e saída colorida.
//!
//! Usa as crates `indicatif` para a barra de progresso e `console` para
//! estilização com cores. O [`RunProgress`] acompanha visualmente a execução
//! de uma sessão; as funções `print_*` formatam relatórios e resumos.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::controller::StatusReport;
use crate::scheduler::{RunEvent, RunObserver, RunSummary, StateCounts};
use crate::state_machine::{AttemptOutcome, JobState, Transition};

/// Indicador visual de progresso para a execução de uma sessão.
///
/// A barra avança a cada unidade que chega a um estado terminal; retentativas
/// aparecem em amarelo e falhas definitivas em vermelho acima da barra.
pub struct RunProgress {
    // Barra de progresso do indicatif.
    pb: ProgressBar,
    red: Style,
    yellow: Style,
}

impl RunProgress {
    pub fn new() -> Self {
        let pb = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("=> "));
        }
        Self {
            pb,
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Progresso invisível, para saída redirecionada ou `--verbose`.
    pub fn hidden() -> Self {
        let progress = Self::new();
        progress.pb.set_draw_target(indicatif::ProgressDrawTarget::hidden());
        progress
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

impl Default for RunProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl RunObserver for RunProgress {
    fn on_event(&self, event: RunEvent<'_>) {
        match event {
            RunEvent::Started { total, queued } => {
                self.pb.set_length(queued as u64);
                self.pb.set_message(format!("{queued} of {total} unit(s) to run"));
                self.pb.enable_steady_tick(Duration::from_millis(100));
            }
            RunEvent::Dispatched { key, attempt } => {
                self.pb.set_message(format!("{key} (attempt {attempt})"));
            }
            RunEvent::Finished { record, transition } => match transition {
                Transition::Retry { attempt, reason } => {
                    self.pb.println(format!(
                        "  {} {}: {reason}, retrying (attempt {attempt})",
                        self.yellow.apply_to("↻"),
                        record.key
                    ));
                }
                Transition::Complete(outcome) => {
                    self.pb.inc(1);
                    match outcome {
                        AttemptOutcome::Succeeded => {}
                        AttemptOutcome::Failed(reason) => self.pb.println(format!(
                            "  {} {}: {reason}",
                            self.red.apply_to("✗"),
                            record.key
                        )),
                        AttemptOutcome::Aborted => self.pb.println(format!(
                            "  {} {}: aborted",
                            self.yellow.apply_to("■"),
                            record.key
                        )),
                    }
                }
            },
            RunEvent::Aborting { in_flight } => {
                self.pb.println(format!(
                    "  {} Aborting, waiting for {in_flight} running unit(s)",
                    self.yellow.apply_to("■")
                ));
            }
        }
    }
}

fn state_style(state: JobState) -> Style {
    match state {
        JobState::Succeeded => Style::new().green(),
        JobState::Failed => Style::new().red().bold(),
        JobState::Running => Style::new().cyan(),
        JobState::Pending | JobState::Aborted => Style::new().yellow(),
    }
}

fn counts_line(counts: &StateCounts) -> String {
    JobState::ALL
        .iter()
        .filter(|s| counts.get(**s) > 0)
        .map(|s| {
            state_style(*s)
                .apply_to(format!("{} {}", counts.get(*s), s.to_string().to_lowercase()))
                .to_string()
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Imprime o resumo final de uma execução.
pub fn print_summary(session: &str, summary: &RunSummary) {
    let headline = match summary.exit_code() {
        0 => Style::new().green().bold().apply_to("✓ completed"),
        130 => Style::new().yellow().bold().apply_to("■ aborted"),
        _ => Style::new().red().bold().apply_to("✗ finished with failures"),
    };
    println!("{headline} session '{session}'");
    println!(
        "  {} ({} invocation(s) this run)",
        counts_line(&summary.counts),
        summary.invocations
    );
}

/// Imprime o relatório de status como tabela colorida.
pub fn print_status(report: &StatusReport) {
    let dim = Style::new().dim();
    println!(
        "Session '{}' {}",
        report.session,
        dim.apply_to(format!("(updated {})", report.updated_at.format("%Y-%m-%d %H:%M:%S")))
    );
    if report.abort_requested {
        println!("  {}", Style::new().yellow().apply_to("abort requested"));
    }
    let width = report
        .units
        .iter()
        .map(|u| u.key.len())
        .max()
        .unwrap_or(3)
        .max(3);
    println!(
        "{}",
        dim.apply_to(format!(
            "  {:<width$}  {:<9}  {:>8}  {:>4}  {:>9}  LAST FAILURE",
            "KEY", "STATE", "ATTEMPTS", "EXIT", "DURATION"
        ))
    );
    for unit in &report.units {
        let state = format!("{:<9}", unit.state.to_string());
        println!(
            "  {:<width$}  {}  {:>8}  {:>4}  {:>9}  {}",
            unit.key,
            state_style(unit.state).apply_to(state),
            unit.attempts,
            unit.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
            unit.duration_ms.map(format_duration).unwrap_or_else(|| "-".into()),
            unit.last_failure.as_deref().unwrap_or(""),
        );
    }
    println!("  {}", counts_line(&report.counts));
}

/// Imprime o relatório de status em JSON.
pub fn print_status_json(report: &StatusReport) {
    println!(
        "{}",
        serde_json::to_string_pretty(report).unwrap_or_default()
    );
}

fn format_duration(ms: u64) -> String {
    match ms {
        0..1_000 => format!("{ms}ms"),
        1_000..60_000 => format!("{:.1}s", ms as f64 / 1000.0),
        _ => format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_are_compact() {
        assert_eq!(format_duration(250), "250ms");
        assert_eq!(format_duration(1_500), "1.5s");
        assert_eq!(format_duration(125_000), "2m05s");
    }

    #[test]
    fn counts_line_skips_empty_states() {
        console::set_colors_enabled(false);
        let counts = StateCounts {
            succeeded: 2,
            failed: 1,
            ..Default::default()
        };
        assert_eq!(counts_line(&counts), "2 succeeded, 1 failed");
    }
}
