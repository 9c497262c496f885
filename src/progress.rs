use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Yellow braille spinner followed by the current message.
pub fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("\x1b[33m{spinner}\x1b[0m {wide_msg}")
        .unwrap()
        .tick_strings(&["⣾", "⣽", "⣻", "⢿", "⡿", "⣟", "⣯", "⣷"])
}

pub fn ok_style() -> ProgressStyle {
    ProgressStyle::with_template("\x1b[32m✔\x1b[0m {wide_msg}").unwrap()
}

pub fn err_style() -> ProgressStyle {
    ProgressStyle::with_template("\x1b[31m✘\x1b[0m {wide_msg}").unwrap()
}

/// Start a ticking spinner for one submission step.
pub fn step(msg: impl Into<String>) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(spinner_style());
    pb.set_message(msg.into());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Close a step spinner with a check mark or a cross.
pub fn finish<T, E: std::fmt::Display>(
    pb: &ProgressBar,
    res: &Result<T, E>,
    ok_msg: impl Into<String>,
) {
    match res {
        Ok(_) => {
            pb.set_style(ok_style());
            pb.finish_with_message(ok_msg.into());
        }
        Err(e) => {
            pb.set_style(err_style());
            pb.finish_with_message(format!("{} (error: {})", pb.message(), e));
        }
    }
}
