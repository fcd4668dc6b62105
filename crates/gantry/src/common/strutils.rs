use std::borrow::Cow;
use std::time::Duration;

/// Return the input string with an added "s" at the end if `count` is larger than one and non-zero.
pub fn pluralize(value: &str, count: usize) -> Cow<str> {
    if count == 1 {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(format!("{}s", value))
    }
}

/// Format a duration as a Slurm/PBS time string, e.g. 01:05:02
pub fn format_hms(duration: &Duration) -> String {
    let mut seconds = duration.as_secs();
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    seconds %= 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Compose a job name from the names of the tests it covers. Only the first
/// few names are used, the rest are elided.
pub fn compose_job_name(prefix: &str, names: &[&str]) -> String {
    const SHOWN: usize = 4;
    let mut name = format!("{} {}", prefix, names[..names.len().min(SHOWN)].join(","));
    if names.len() > SHOWN {
        name.push_str(" ...");
    }
    name
}
