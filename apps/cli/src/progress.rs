//! Terminal progress for running jobs.

use std::time::Duration;

use color_eyre::eyre::Result;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use varnika_core::JobTracker;
use varnika_shared::{Job, JobId};

/// Add a progress bar for one job to `multi`.
pub(crate) fn job_bar(multi: &MultiProgress, prefix: &str) -> ProgressBar {
    let bar = multi.add(ProgressBar::new(100));
    let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold} [{bar:24}] {pos:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .progress_chars("=> ");
    bar.set_style(style);
    bar.set_prefix(prefix.to_string());
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

/// Mirror a job's snapshots onto `bar` until it reaches a terminal state.
pub(crate) async fn follow(tracker: &JobTracker, id: JobId, bar: ProgressBar) -> Result<Job> {
    let mut rx = tracker.subscribe(id)?;
    loop {
        let terminal = {
            let job = rx.borrow_and_update();
            bar.set_position(u64::from(job.progress()));
            bar.set_message(format!("{}: {}", job.stage_label(), job.message()));
            job.is_terminal()
        };
        if terminal || rx.changed().await.is_err() {
            break;
        }
    }
    bar.finish_and_clear();
    Ok(tracker.wait(id).await?)
}
