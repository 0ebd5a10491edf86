//! Fixed-capacity diagnostic ring buffer for per-tick servo telemetry.
//!
//! Follows the call sites `pbio_logger_add_row`/`pbio_logger_is_active` in
//! `servo.c` and the column layout of its `log_data` array. This is
//! diagnostics only — nothing in this crate ships log rows off-device; a
//! caller drains the ring and does whatever it wants with the rows (print
//! over RTT, copy out over USB, etc).

/// One per-tick log row, columns in the order `servo.c`'s `log_data` array
/// uses: current time, application-unit measured position/speed,
/// actuation+stall flags, applied voltage, estimated position/speed, the
/// feedback/feedforward torque split, and the observer's error feedback
/// voltage.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, defmt::Format)]
pub struct LogRow {
    pub time_ticks: u32,
    pub position_deg: i32,
    pub speed_deg_s: i32,
    pub actuation_and_stall_flags: i32,
    pub voltage_mv: i32,
    pub est_position_deg: i32,
    pub est_speed_deg_s: i32,
    pub feedback_torque_unm: i32,
    pub feedforward_torque_unm: i32,
    pub observer_feedback_voltage_mv: i32,
}

/// Bounded ring buffer of [`LogRow`]s. Push never blocks or allocates:
/// once full, the oldest row is overwritten.
pub struct Logger<const N: usize> {
    rows: heapless::Vec<LogRow, N>,
    next: usize,
    active: bool,
}

impl<const N: usize> Logger<N> {
    pub const fn new() -> Self {
        Logger {
            rows: heapless::Vec::new(),
            next: 0,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
        if !active {
            self.clear();
        }
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.next = 0;
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn capacity(&self) -> usize {
        N
    }

    /// Appends a row if logging is active. Once the buffer is full this
    /// overwrites the oldest entry rather than growing or dropping the new
    /// one, so a long-running move always keeps the most recent window.
    pub fn add_row(&mut self, row: LogRow) {
        if !self.active {
            return;
        }
        if self.rows.len() < N {
            // push() cannot fail: len() < N == capacity.
            let _ = self.rows.push(row);
        } else {
            self.rows[self.next] = row;
            self.next = (self.next + 1) % N;
        }
    }

    /// Rows in chronological order (oldest first), regardless of where the
    /// ring's write cursor currently sits.
    pub fn rows(&self) -> impl Iterator<Item = &LogRow> {
        let wrapped = self.rows.len() == N;
        let start = if wrapped { self.next } else { 0 };
        (0..self.rows.len()).map(move |i| &self.rows[(start + i) % N])
    }
}

impl<const N: usize> Default for Logger<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(t: u32) -> LogRow {
        LogRow {
            time_ticks: t,
            ..Default::default()
        }
    }

    #[test]
    fn inactive_logger_drops_rows() {
        let mut log: Logger<4> = Logger::new();
        log.add_row(row(1));
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn active_logger_keeps_rows_in_order() {
        let mut log: Logger<4> = Logger::new();
        log.set_active(true);
        for t in 0..3 {
            log.add_row(row(t));
        }
        let times: heapless::Vec<u32, 4> = log.rows().map(|r| r.time_ticks).collect();
        assert_eq!(times.as_slice(), &[0, 1, 2]);
    }

    #[test]
    fn full_ring_overwrites_oldest_row_first() {
        let mut log: Logger<3> = Logger::new();
        log.set_active(true);
        for t in 0..5 {
            log.add_row(row(t));
        }
        let times: heapless::Vec<u32, 3> = log.rows().map(|r| r.time_ticks).collect();
        assert_eq!(times.as_slice(), &[2, 3, 4]);
    }

    #[test]
    fn deactivating_clears_the_buffer() {
        let mut log: Logger<4> = Logger::new();
        log.set_active(true);
        log.add_row(row(1));
        log.set_active(false);
        assert_eq!(log.len(), 0);
    }
}
