use super::Host;
use colored::Colorize;
use incusflow_core::{Outcome, ReconcileError, Reconciler};
use incusflow_incus::{RequestEnvelope, parse_requests};
use std::io::Read;
use std::path::Path;

/// Reconcile every request in `file`, printing one JSON response per line
///
/// Returns false when a request failed; later requests are not attempted.
pub fn handle(host: &Host, file: &Path, check: bool) -> anyhow::Result<bool> {
    let text = if file == Path::new("-") {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        text
    } else {
        std::fs::read_to_string(file)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {}", file.display(), e))?
    };

    let envelopes = match parse_requests(&text) {
        Ok(envelopes) => envelopes,
        Err(e) => {
            report_failure(&e);
            return Ok(false);
        }
    };

    let ctx = host.context();
    let mut summary = Summary::default();
    for envelope in envelopes {
        match reconcile(host, &ctx, envelope, check) {
            Ok(outcome) => {
                println!("{}", outcome.to_response());
                summary.record(&outcome);
            }
            Err(e) => {
                report_failure(&e);
                summary.print();
                return Ok(false);
            }
        }
    }
    summary.print();
    Ok(true)
}

fn reconcile(
    host: &Host,
    ctx: &incusflow_incus::Context,
    envelope: RequestEnvelope,
    check: bool,
) -> incusflow_core::Result<Outcome> {
    let adapter = envelope.request.adapter(ctx)?;
    let mut reconciler = Reconciler::new(&host.executor).check_mode(check || envelope.check_mode);
    if let Some(cache) = &host.cache {
        reconciler = reconciler.with_cache(cache);
    }
    reconciler.reconcile(adapter.as_ref())
}

fn report_failure(error: &ReconcileError) {
    println!("{}", error.to_response());
    eprintln!("{} {}", "✗".red().bold(), error.to_string().red());
}

#[derive(Default)]
struct Summary {
    changed: usize,
    unchanged: usize,
}

impl Summary {
    fn record(&mut self, outcome: &Outcome) {
        if outcome.changed {
            self.changed += 1;
            eprintln!("{} {}", "✓".green(), outcome.msg.yellow());
            for change in &outcome.changes {
                eprintln!("    {}", change.dimmed());
            }
        } else {
            self.unchanged += 1;
            eprintln!("{} {}", "✓".green(), outcome.msg);
        }
    }

    fn print(&self) {
        eprintln!(
            "{} {} changed, {} unchanged",
            "→".cyan(),
            self.changed.to_string().yellow(),
            self.unchanged
        );
    }
}
