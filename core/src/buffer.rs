//! Bounded send and receive queues for connections
//!
//! Each connection owns a byte-bounded output queue (sendq) and input
//! accumulator (recvq). Exceeding either limit is fatal for the
//! connection: the caller closes it with a "SendQ exceeded" or
//! "RecvQ exceeded" error rather than silently dropping data.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Outgoing data queue with a byte-size cap.
#[derive(Debug)]
pub struct SendQueue {
    buffer: VecDeque<String>,
    current_size: usize,
    max_size: usize,
    last_write: Option<Instant>,
}

impl SendQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: VecDeque::new(),
            current_size: 0,
            max_size,
            last_write: None,
        }
    }

    /// Queue a wire line. Returns false when the queue cap would be
    /// exceeded; the connection must then be closed.
    pub fn push(&mut self, line: String) -> bool {
        if self.current_size + line.len() > self.max_size {
            tracing::warn!(
                queued = self.current_size,
                max = self.max_size,
                "sendq limit exceeded"
            );
            return false;
        }
        self.current_size += line.len();
        self.buffer.push_back(line);
        self.last_write = Some(Instant::now());
        true
    }

    /// Remove and return the next pending line.
    pub fn pop(&mut self) -> Option<String> {
        let line = self.buffer.pop_front()?;
        self.current_size = self.current_size.saturating_sub(line.len());
        Some(line)
    }

    /// Drain everything pending into one write batch.
    pub fn drain_all(&mut self) -> Vec<String> {
        self.current_size = 0;
        self.buffer.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn current_size(&self) -> usize {
        self.current_size
    }

    pub fn time_since_last_write(&self) -> Option<Duration> {
        self.last_write.map(|t| t.elapsed())
    }
}

/// Incoming data accumulator with a byte-size cap.
#[derive(Debug)]
pub struct RecvQueue {
    buffer: String,
    max_size: usize,
}

impl RecvQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: String::new(),
            max_size,
        }
    }

    /// Append raw data. Returns false when the accumulator cap would be
    /// exceeded; the connection must then be closed.
    pub fn append(&mut self, data: &str) -> bool {
        if self.buffer.len() + data.len() > self.max_size {
            tracing::warn!(
                buffered = self.buffer.len(),
                max = self.max_size,
                "recvq limit exceeded"
            );
            return false;
        }
        self.buffer.push_str(data);
        true
    }

    /// Extract complete lines. Accepts CR, LF or CRLF terminators and
    /// drops empty lines; a trailing partial line is retained.
    pub fn extract_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.find(['\r', '\n']) {
            let line: String = self.buffer.drain(..pos).collect();
            // Swallow the terminator (and its partner for CRLF).
            let mut removed = self.buffer.remove(0);
            if removed == '\r' && self.buffer.starts_with('\n') {
                removed = self.buffer.remove(0);
            }
            let _ = removed;
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    pub fn current_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn has_incomplete_data(&self) -> bool {
        !self.buffer.is_empty()
    }
}

/// Per-connection timing used by the ping cycle.
#[derive(Debug, Clone)]
pub struct ConnectionTiming {
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub last_ping_sent: Option<Instant>,
    pub unanswered_pings: u32,
    pub ping_frequency: u64,
    pub connection_timeout: u64,
}

impl ConnectionTiming {
    pub fn new(ping_frequency: u64, connection_timeout: u64) -> Self {
        let now = Instant::now();
        Self {
            connected_at: now,
            last_activity: now,
            last_ping_sent: None,
            unanswered_pings: 0,
            ping_frequency,
            connection_timeout,
        }
    }

    pub fn update_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn record_ping_sent(&mut self) {
        self.last_ping_sent = Some(Instant::now());
        self.unanswered_pings += 1;
    }

    pub fn record_pong_received(&mut self) {
        self.unanswered_pings = 0;
        self.update_activity();
    }

    pub fn should_send_ping(&self) -> bool {
        let idle = match self.last_ping_sent {
            Some(last) => last.elapsed(),
            None => self.last_activity.elapsed(),
        };
        idle >= Duration::from_secs(self.ping_frequency)
    }

    pub fn is_timed_out(&self) -> bool {
        self.last_activity.elapsed() >= Duration::from_secs(self.connection_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sendq_basic() {
        let mut sendq = SendQueue::new(100);

        assert!(sendq.push("PRIVMSG #test :Hello\r\n".to_string()));
        assert_eq!(sendq.len(), 1);
        assert!(sendq.current_size() > 0);

        let line = sendq.pop();
        assert_eq!(line, Some("PRIVMSG #test :Hello\r\n".to_string()));
        assert!(sendq.is_empty());
        assert_eq!(sendq.current_size(), 0);
    }

    #[test]
    fn test_sendq_overflow_is_refused() {
        let mut sendq = SendQueue::new(30);
        assert!(sendq.push("PRIVMSG #test :Hello\r\n".to_string()));
        assert!(!sendq.push("PRIVMSG #test :this line will not fit\r\n".to_string()));
    }

    #[test]
    fn test_recvq_crlf_and_lf() {
        let mut recvq = RecvQueue::new(1000);
        assert!(recvq.append("NICK test\r\nUSER a b c :d\nPING"));
        let lines = recvq.extract_lines();
        assert_eq!(lines, vec!["NICK test", "USER a b c :d"]);
        assert!(recvq.has_incomplete_data());

        assert!(recvq.append(" :x\r\n"));
        assert_eq!(recvq.extract_lines(), vec!["PING :x"]);
        assert!(!recvq.has_incomplete_data());
    }

    #[test]
    fn test_recvq_skips_empty_lines() {
        let mut recvq = RecvQueue::new(1000);
        assert!(recvq.append("\r\n\r\nQUIT\r\n"));
        assert_eq!(recvq.extract_lines(), vec!["QUIT"]);
    }

    #[test]
    fn test_recvq_overflow_is_refused() {
        let mut recvq = RecvQueue::new(8);
        assert!(!recvq.append("a line that is too long"));
    }

    #[test]
    fn test_connection_timing() {
        let mut timing = ConnectionTiming::new(120, 300);

        assert!(!timing.is_timed_out());
        assert_eq!(timing.unanswered_pings, 0);

        timing.record_ping_sent();
        assert_eq!(timing.unanswered_pings, 1);

        timing.record_pong_received();
        assert_eq!(timing.unanswered_pings, 0);
    }
}
