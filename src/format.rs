use atty::Stream;
use colored::{ColoredString, Colorize};

// This trait has a function for formatting "code-like" text, such as a task
// name, a branch, or a file path.
pub trait CodeStr {
    fn code_str(&self) -> ColoredString;
}

impl CodeStr for str {
    fn code_str(&self) -> ColoredString {
        if atty::is(Stream::Stdout) {
            self.magenta()
        } else {
            ColoredString::from(&format!("`{}`", self) as &Self)
        }
    }
}

// This function takes a number and a noun and returns a string representing
// the noun with the given multiplicity (pluralizing if necessary). For
// example, (3, "task") becomes "3 tasks".
pub fn number(n: usize, noun: &str) -> String {
    if n == 1 {
        format!("{} {}", n, noun)
    } else {
        format!("{} {}s", n, noun)
    }
}

// Format a wall-clock duration in seconds the way humans read build times:
// `H:MM:SS`, or whole days once it stops being useful to count seconds.
pub fn duration(total_seconds: u64) -> String {
    let days = total_seconds / 86_400;
    if days >= 1 {
        number(days as usize, "day")
    } else {
        format!(
            "{}:{:02}:{:02}",
            total_seconds / 3600,
            (total_seconds % 3600) / 60,
            total_seconds % 60,
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::format::{duration, number};

    #[test]
    fn number_zero() {
        assert_eq!(number(0, "task"), "0 tasks");
    }

    #[test]
    fn number_one() {
        assert_eq!(number(1, "task"), "1 task");
    }

    #[test]
    fn number_two() {
        assert_eq!(number(2, "task"), "2 tasks");
    }

    #[test]
    fn duration_seconds() {
        assert_eq!(duration(7), "0:00:07");
    }

    #[test]
    fn duration_minutes() {
        assert_eq!(duration(65), "0:01:05");
    }

    #[test]
    fn duration_hours() {
        assert_eq!(duration(3661), "1:01:01");
    }

    #[test]
    fn duration_days() {
        assert_eq!(duration(86_400 * 2 + 5), "2 days");
    }
}
