/// Weighted running average since the last reset.
#[derive(Debug, Clone, Default)]
pub struct AverageMeter {
    sum: f64,
    count: f64,
    last: f64,
}

impl AverageMeter {
    pub fn update(&mut self, value: f64, weight: f64) {
        self.last = value;
        self.sum += value * weight;
        self.count += weight;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Zero when nothing has been recorded since the last reset.
    pub fn average(&self) -> f64 {
        if self.count == 0.0 {
            0.0
        } else {
            self.sum / self.count
        }
    }

    pub fn last(&self) -> f64 {
        self.last
    }

    pub fn count(&self) -> f64 {
        self.count
    }
}

/// Host-side values of one training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepMetrics {
    pub batch_size: usize,
    pub total: f32,
    pub ce: f32,
    pub mean_mask: f32,
    pub variation_mask: f32,
    pub top1: f64,
    pub top5: f64,
}

/// All meters tracked by the training loop.
///
/// Loss and precision meters are windowed: they are cleared after each
/// report, so the value shown at the end of an epoch covers only the last
/// reporting window.
#[derive(Debug, Clone, Default)]
pub struct TrainMeters {
    pub batch_time: AverageMeter,
    pub losses: AverageMeter,
    pub ce: AverageMeter,
    pub mean_mask: AverageMeter,
    pub variation_mask: AverageMeter,
    pub top1: AverageMeter,
    pub top5: AverageMeter,
}

impl TrainMeters {
    pub fn update(&mut self, step: &StepMetrics) {
        let n = step.batch_size as f64;
        self.top1.update(step.top1, n);
        self.top5.update(step.top5, n);
        self.losses.update(step.total as f64, n);
        self.mean_mask.update(step.mean_mask as f64, n);
        self.variation_mask.update(step.variation_mask as f64, n);
        self.ce.update(step.ce as f64, n);
    }

    /// Start of an epoch.
    pub fn reset_all(&mut self) {
        *self = Self::default();
    }

    /// After a report. Batch time keeps accumulating for the ETA.
    pub fn reset_window(&mut self) {
        self.losses.reset();
        self.ce.reset();
        self.mean_mask.reset();
        self.variation_mask.reset();
        self.top1.reset();
        self.top5.reset();
    }
}

/// Top-k accuracy in percent for each `k`, from row-major `[batch, classes]` scores.
///
/// A sample counts as correct when fewer than `k` classes score strictly
/// higher than its label.
pub fn accuracy(logits: &[f32], num_classes: usize, labels: &[i64], topk: &[usize]) -> Vec<f64> {
    let batch = labels.len();
    if batch == 0 || num_classes == 0 {
        return vec![0.0; topk.len()];
    }

    let ranks: Vec<usize> = logits
        .chunks(num_classes)
        .zip(labels)
        .map(|(row, &label)| {
            let target = row[label as usize];
            row.iter().filter(|score| **score > target).count()
        })
        .collect();

    topk.iter()
        .map(|&k| {
            let correct = ranks.iter().filter(|rank| **rank < k).count();
            correct as f64 * 100.0 / batch as f64
        })
        .collect()
}

/// Reporting cadence in global steps: a thousandth of an epoch, at least 1.
pub fn report_interval(steps_per_epoch: usize) -> usize {
    (steps_per_epoch / 1000).max(1)
}

/// Seconds left, from the batches remaining in the run and the mean batch time.
pub fn eta_seconds(
    total_epoch: usize,
    current_epoch: usize,
    steps_per_epoch: usize,
    batch_idx: usize,
    avg_batch_time: f64,
) -> f64 {
    let later_epochs = total_epoch.saturating_sub(current_epoch + 1) * steps_per_epoch;
    let this_epoch = steps_per_epoch.saturating_sub(batch_idx + 1);
    (later_epochs + this_epoch) as f64 * avg_batch_time
}

/// `H:MM:SS`
pub fn format_eta(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_meter_single_sample() {
        let mut meter = AverageMeter::default();
        meter.update(3.0, 10.0);
        meter.reset();
        meter.update(0.25, 4.0);
        assert_eq!(meter.average(), 0.25);
    }

    #[test]
    fn test_meter_weighted_average() {
        let mut meter = AverageMeter::default();
        meter.update(1.0, 2.0);
        meter.update(4.0, 6.0);
        assert_relative_eq!(meter.average(), (1.0 * 2.0 + 4.0 * 6.0) / 8.0);
        assert_eq!(meter.last(), 4.0);
    }

    #[test]
    fn test_empty_meter_average_is_zero() {
        let meter = AverageMeter::default();
        assert_eq!(meter.average(), 0.0);
    }

    #[test]
    fn test_window_reset_keeps_batch_time() {
        let mut meters = TrainMeters::default();
        meters.batch_time.update(0.5, 1.0);
        meters.update(&StepMetrics {
            batch_size: 2,
            total: 1.0,
            ce: 1.0,
            mean_mask: 0.5,
            variation_mask: 0.1,
            top1: 50.0,
            top5: 100.0,
        });

        meters.reset_window();
        assert_eq!(meters.losses.count(), 0.0);
        assert_eq!(meters.top1.average(), 0.0);
        assert_eq!(meters.batch_time.average(), 0.5);
    }

    #[test]
    fn test_topk_accuracy() {
        // Three classes, two samples.
        let logits = [0.1, 0.7, 0.2, 0.5, 0.3, 0.2];
        let labels = [1, 2];
        let acc = accuracy(&logits, 3, &labels, &[1, 2, 5]);
        assert_eq!(acc, vec![50.0, 50.0, 100.0]);
    }

    #[test]
    fn test_report_interval_never_zero() {
        assert_eq!(report_interval(5), 1);
        assert_eq!(report_interval(20_018), 20);
    }

    #[test]
    fn test_eta() {
        // Last batch of the last epoch: nothing left.
        assert_eq!(eta_seconds(2, 1, 10, 9, 1.0), 0.0);
        // First batch of the first epoch.
        assert_eq!(eta_seconds(2, 0, 10, 0, 0.5), 9.5);
        assert_eq!(format_eta(3725.0), "1:02:05");
    }
}
