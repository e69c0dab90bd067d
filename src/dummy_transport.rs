//! A [Transport] that never touches hardware. It records every byte the
//! driver writes and answers from a queue of scripted reply bytes, optionally
//! refilled per command by a responder closure. Handy for exercising the
//! driver state machine without a System Control Unit on the desk.

use crate::error::{NdiError, Result};
use crate::transport::{Transport, DEFAULT_BAUD_RATE, LINE_TERMINATOR};

use std::collections::VecDeque;
use std::io;

type Responder = Box<dyn FnMut(&str) -> Vec<u8> + Send>;

/// Scripted stand-in for a serial port.
pub struct DummyTransport {
    open: bool,
    baud: u32,
    baud_history: Vec<u32>,
    rx: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    responder: Option<Responder>,
}

impl Default for DummyTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyTransport {
    /// A closed transport with nothing queued.
    pub fn new() -> Self {
        DummyTransport {
            open: false,
            baud: DEFAULT_BAUD_RATE,
            baud_history: Vec::new(),
            rx: VecDeque::new(),
            written: Vec::new(),
            responder: None,
        }
    }

    /// Answer every written command with whatever `f` returns for it. The
    /// command text is passed without its terminator.
    pub fn with_responder<F>(mut self, f: F) -> Self
    where
        F: FnMut(&str) -> Vec<u8> + Send + 'static,
    {
        self.responder = Some(Box::new(f));
        self
    }

    /// Queue a text reply; the line terminator is appended.
    pub fn queue_line(&mut self, line: &str) {
        self.rx.extend(line.bytes());
        self.rx.push_back(LINE_TERMINATOR);
    }

    /// Queue raw reply bytes.
    pub fn queue_bytes(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    /// Every write so far, with the trailing terminator stripped.
    pub fn written(&self) -> &[Vec<u8>] {
        &self.written
    }

    /// Every write so far as text.
    pub fn commands(&self) -> Vec<String> {
        self.written
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    /// Reply bytes that have been queued but not yet read.
    pub fn remaining(&self) -> usize {
        self.rx.len()
    }

    /// Current local baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.baud
    }

    /// Every baud rate change, in order.
    pub fn baud_history(&self) -> &[u32] {
        &self.baud_history
    }
}

impl Transport for DummyTransport {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.open {
            return Err(NdiError::PortNotOpen);
        }
        let command = bytes.strip_suffix(&[LINE_TERMINATOR]).unwrap_or(bytes);
        self.written.push(command.to_vec());
        if let Some(responder) = self.responder.as_mut() {
            let reply = responder(&String::from_utf8_lossy(command));
            self.rx.extend(reply);
        }
        Ok(())
    }

    fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        if !self.open {
            return Err(NdiError::PortNotOpen);
        }
        if self.rx.len() < n {
            self.rx.clear();
            return Err(NdiError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("wanted {} bytes, device went quiet", n),
            )));
        }
        Ok(self.rx.drain(..n).collect())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        self.baud = baud;
        self.baud_history.push(baud);
        Ok(())
    }
}
