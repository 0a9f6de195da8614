use serde::{Deserialize, Serialize};

/// One timed line as returned by the backend's `/lyrics` endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LyricLine {
    pub seconds: f64,
    pub lyrics: String,
}

/// Timed lyrics for one track, ordered by start time.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LyricSheet {
    lines: Vec<LyricLine>,
}

impl LyricSheet {
    pub fn new(mut lines: Vec<LyricLine>) -> Self {
        lines.retain(|line| line.seconds.is_finite());
        lines.sort_by(|a, b| a.seconds.total_cmp(&b.seconds));
        Self { lines }
    }

    pub fn lines(&self) -> &[LyricLine] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The line being sung at `time`: the last one that has started.
    pub fn active_line(&self, time: f64) -> Option<usize> {
        let started = self.lines.partition_point(|line| line.seconds <= time);
        started.checked_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(seconds: f64, text: &str) -> LyricLine {
        LyricLine {
            seconds,
            lyrics: text.to_string(),
        }
    }

    #[test]
    fn active_line_follows_playback_time() {
        let sheet = LyricSheet::new(vec![line(10.0, "b"), line(0.5, "a"), line(20.0, "c")]);
        assert_eq!(sheet.lines()[0].lyrics, "a");
        assert_eq!(sheet.active_line(0.0), None);
        assert_eq!(sheet.active_line(0.5), Some(0));
        assert_eq!(sheet.active_line(15.0), Some(1));
        assert_eq!(sheet.active_line(500.0), Some(2));
    }

    #[test]
    fn empty_sheet_has_no_active_line() {
        assert_eq!(LyricSheet::default().active_line(3.0), None);
    }
}
