use crate::document::StoryState;
use crate::metrics::AttemptFailure;
use crate::runner::StoryOutcome;
use crate::ui::icons::{BLOCKER, CHECK, CROSS, REVIEW, ROLLBACK, RUNNING, SPARKLE};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Terminal UI for story execution, rendered via `indicatif` progress bars.
///
/// Two bars are stacked vertically:
/// - Story bar: how many stories have reached a terminal state
/// - Attempt bar: spinner with the current attempt and stage
pub struct StoryProgress {
    multi: MultiProgress,
    story_bar: ProgressBar,
    attempt_bar: ProgressBar,
    verbose: bool,
    current_attempt: AtomicU32,
    max_attempts: AtomicU32,
}

impl StoryProgress {
    /// Create the UI with a story bar sized to `total_stories`.
    pub fn new(total_stories: u64, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let story_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let story_bar = multi.add(ProgressBar::new(total_stories));
        story_bar.set_style(story_style);
        story_bar.set_prefix("Stories");

        let attempt_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");

        let attempt_bar = multi.add(ProgressBar::new_spinner());
        attempt_bar.set_style(attempt_style);
        attempt_bar.set_prefix("Attempt");

        Self {
            multi,
            story_bar,
            attempt_bar,
            verbose,
            current_attempt: AtomicU32::new(0),
            max_attempts: AtomicU32::new(0),
        }
    }

    /// Print a line via `MultiProgress`, falling back to `eprintln!`.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn start_story(&self, id: &str, title: &str) {
        self.story_bar
            .set_message(format!("{}: {}", style(id).yellow(), title));
        self.print_line(format!(
            "{} Story {}: {}",
            RUNNING,
            style(id).yellow().bold(),
            title
        ));
    }

    /// Record attempt counters and start the spinner.
    pub fn start_attempt(&self, attempt: u32, max: u32) {
        self.current_attempt.store(attempt, Ordering::SeqCst);
        self.max_attempts.store(max, Ordering::SeqCst);
        self.attempt_bar.reset();
        self.attempt_bar.set_message(format!(
            "Attempt {}/{} {}",
            style(attempt).cyan(),
            max,
            style("(starting...)").dim()
        ));
        self.attempt_bar
            .enable_steady_tick(Duration::from_millis(100));
    }

    pub fn stage(&self, state: StoryState) {
        let attempt = self.current_attempt.load(Ordering::SeqCst);
        let max = self.max_attempts.load(Ordering::SeqCst);
        self.attempt_bar.set_message(format!(
            "Attempt {}/{} {}",
            style(attempt).cyan(),
            max,
            style(format!("({state})")).dim()
        ));
        if self.verbose {
            self.print_line(format!("    {} {}", style("→").dim(), style(state).dim()));
        }
    }

    pub fn validator_result(&self, name: &str, passed: bool) {
        if passed {
            self.print_line(format!("    {} {} {}", REVIEW, name, style("passed").green()));
        } else {
            self.print_line(format!("    {} {} {}", REVIEW, name, style("failed").red()));
        }
    }

    pub fn attempt_failed(&self, attempt: u32, failure: &AttemptFailure) {
        self.attempt_bar
            .finish_with_message(format!("{} Attempt {} failed", CROSS, attempt));
        self.print_line(format!("    {} {}", BLOCKER, style(failure).red()));
    }

    /// Advance the story bar and print the terminal state.
    pub fn story_finished(&self, outcome: &StoryOutcome) {
        self.story_bar.inc(1);
        let line = match outcome.state {
            StoryState::Passed => format!(
                "{} Story {} passed after {} attempt(s)",
                CHECK,
                style(&outcome.id).green().bold(),
                outcome.attempts_used
            ),
            StoryState::RolledBack => format!(
                "{} Story {} rolled back: {}",
                ROLLBACK,
                style(&outcome.id).yellow().bold(),
                outcome.reason.as_deref().unwrap_or("attempts exhausted")
            ),
            _ => format!(
                "{} Story {} {}: {}",
                CROSS,
                style(&outcome.id).red().bold(),
                outcome.state,
                outcome.reason.as_deref().unwrap_or("")
            ),
        };
        if outcome.passed {
            self.attempt_bar.finish_and_clear();
        }
        self.print_line(line);
    }

    pub fn finish(&self, passed: usize, total: usize) {
        self.attempt_bar.finish_and_clear();
        self.story_bar
            .finish_with_message(format!("{} {}/{} stories passed", SPARKLE, passed, total));
    }
}
