//! Simulated adapter - scripted ELM327 responder for testing
//!
//! Serves the adapter dialect over a loopback TCP socket so the whole
//! stack (framing, commands, sampling) can run without hardware. Simulates
//! an engine idling around 850 RPM with random wobble.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::protocol::{COMMAND_TERMINATOR, PROMPT};

/// A scripted adapter listening on a loopback port.
pub struct SimAdapter {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SimAdapter {
    /// Bind an ephemeral loopback port and start serving.
    pub fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let worker = std::thread::spawn(move || serve(listener, flag));
        tracing::debug!(%addr, "simulated adapter listening");
        Ok(Self {
            addr,
            shutdown,
            worker: Some(worker),
        })
    }

    /// Address clients should connect to, as `host:port`.
    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// Stop serving and join the worker.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SimAdapter {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn serve(listener: TcpListener, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "simulated adapter accepted client");
                if let Err(e) = serve_client(stream, &shutdown) {
                    tracing::debug!(error = %e, "simulated client session ended");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                tracing::warn!(error = %e, "simulated adapter accept failed");
                break;
            }
        }
    }
}

fn serve_client(mut stream: TcpStream, shutdown: &AtomicBool) -> io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_millis(50)))?;
    let mut engine = SimEngine::new();
    let mut request = Vec::new();
    let mut last_response = String::from("?\r\r");
    let mut byte = [0u8; 1];
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        match stream.read(&mut byte) {
            Ok(0) => return Ok(()),
            Ok(_) if byte[0] == COMMAND_TERMINATOR => {
                let line = String::from_utf8_lossy(&request).trim().to_uppercase();
                request.clear();
                let response = if line.is_empty() {
                    // a lone carriage return repeats the previous command
                    last_response.clone()
                } else {
                    let r = engine.respond(&line);
                    last_response = r.clone();
                    r
                };
                stream.write_all(response.as_bytes())?;
                stream.write_all(&[PROMPT])?;
            }
            Ok(_) => request.push(byte[0]),
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => return Err(e),
        }
    }
}

/// Scripted engine state behind the responder.
struct SimEngine {
    rng: StdRng,
    searched: bool,
}

impl SimEngine {
    fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            searched: false,
        }
    }

    fn respond(&mut self, request: &str) -> String {
        match request {
            "AT Z" | "ATZ" => "ELM327 v1.5\r\r".to_string(),
            "AT RV" | "ATRV" => {
                let volts = self.rng.gen_range(11.8..12.8);
                format!("{volts:.1}V\r\r")
            }
            r if r.starts_with("AT") => "OK\r\r".to_string(),
            "01 0C" | "010C" => {
                let rpm: u32 = 850 + self.rng.gen_range(0..40);
                let raw = rpm * 4;
                let frame = format!("41 0C {:02X} {:02X} \r\r", raw / 256, raw % 256);
                self.with_search_preamble(frame)
            }
            "01 0D" | "010D" => {
                let speed: u8 = self.rng.gen_range(0..120);
                let frame = format!("41 0D {speed:02X} \r\r");
                self.with_search_preamble(frame)
            }
            _ => "?\r\r".to_string(),
        }
    }

    /// The first OBD request after power-up triggers a protocol search, so
    /// the response starts with the usual chatter.
    fn with_search_preamble(&mut self, frame: String) -> String {
        if self.searched {
            frame
        } else {
            self.searched = true;
            format!("SEARCHING...\r{frame}")
        }
    }
}
