// Segmentation plan
//
// Pure window math over the normalized audio duration. Extraction of the
// planned windows is I/O and lives with the stage handler; keeping the plan
// deterministic is what makes segment replay idempotent.

/// Minimum emitted window length. Anything shorter at the tail is dropped
/// so a zero-length blob can never be produced.
pub const MIN_SEGMENT_SEC: f64 = 1.0;

/// One planned window over the normalized audio.
///
/// `start/end` include the overlap carried into the head of each window
/// after the first; `original_start/original_end` are the segment-center
/// coordinates in source time, used downstream for output timing so overlap
/// regions never duplicate text.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedWindow {
    pub index: usize,
    pub start_sec: f64,
    pub end_sec: f64,
    pub original_start_sec: f64,
    pub original_end_sec: f64,
}

impl PlannedWindow {
    pub fn duration_sec(&self) -> f64 {
        self.end_sec - self.start_sec
    }
}

/// Compute the full window plan for an audio of `total_duration_sec`.
///
/// For window k: anchor = k * segment_duration; start = max(0, anchor -
/// overlap); end = min(total, anchor + segment_duration). Windows shorter
/// than one second stop the plan.
pub fn plan(
    total_duration_sec: f64,
    segment_duration_sec: f64,
    overlap_sec: f64,
) -> Vec<PlannedWindow> {
    let mut windows = Vec::new();
    if total_duration_sec <= 0.0 || segment_duration_sec <= 0.0 {
        return windows;
    }

    let mut k = 0usize;
    loop {
        let anchor = k as f64 * segment_duration_sec;
        let start = (anchor - overlap_sec).max(0.0);
        let end = (anchor + segment_duration_sec).min(total_duration_sec);

        if end - start < MIN_SEGMENT_SEC {
            break;
        }

        windows.push(PlannedWindow {
            index: k,
            start_sec: start,
            end_sec: end,
            original_start_sec: anchor,
            original_end_sec: anchor + segment_duration_sec,
        });

        if end >= total_duration_sec {
            break;
        }
        k += 1;
    }

    windows
}
