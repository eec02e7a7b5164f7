// SPDX-License-Identifier: MIT
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::Client;

use super::policy::Command;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActuationOutcome {
    Success,
    /// The device answered with a non-200 status.
    RemoteError(u16),
    /// The device could not be reached before the timeout.
    ConnectionError(String),
}

impl ActuationOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Delivers a command to the controlled device. Never retries.
pub trait Actuator {
    fn send(&mut self, command: Command) -> ActuationOutcome;
}

impl<T: Actuator + ?Sized> Actuator for Box<T> {
    fn send(&mut self, command: Command) -> ActuationOutcome {
        (**self).send(command)
    }
}

impl<T: Actuator + ?Sized> Actuator for &mut T {
    fn send(&mut self, command: Command) -> ActuationOutcome {
        (**self).send(command)
    }
}

/// Sends `GET {base_url}/{command}` and treats 200 as acknowledged.
///
/// The client's connection pool is reused across calls; the timeout applies
/// to each request on its own.
pub struct HttpActuator {
    client: Client,
    base_url: String,
}

impl HttpActuator {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    #[must_use]
    pub fn url_for(&self, command: Command) -> String {
        format!("{}/{}", self.base_url, command.name())
    }
}

impl Actuator for HttpActuator {
    fn send(&mut self, command: Command) -> ActuationOutcome {
        let url = self.url_for(command);
        match self.client.get(&url).send() {
            Ok(response) if response.status() == StatusCode::OK => {
                log::info!("command sent: {command}");
                ActuationOutcome::Success
            }
            Ok(response) => {
                let status = response.status();
                log::warn!("device rejected '{command}' with status {status}");
                ActuationOutcome::RemoteError(status.as_u16())
            }
            Err(e) => {
                log::warn!("could not reach device at {url}: {e}");
                ActuationOutcome::ConnectionError(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    use super::*;

    /// Answers one request with `status_line` and reports the request path.
    fn one_shot_server(status_line: &'static str) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            loop {
                let mut header = String::new();
                if reader.read_line(&mut header).unwrap() == 0 || header == "\r\n" {
                    break;
                }
            }
            let path = request_line.split_whitespace().nth(1).unwrap_or("").to_owned();
            tx.send(path).unwrap();
            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 {status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            )
            .unwrap();
        });
        (format!("http://{addr}"), rx)
    }

    #[test]
    fn builds_command_urls() {
        let actuator = HttpActuator::new("http://10.0.0.7/", Duration::from_secs(1)).unwrap();
        assert_eq!(actuator.url_for(Command::Left), "http://10.0.0.7/left");
        assert_eq!(actuator.url_for(Command::Stop), "http://10.0.0.7/stop");
    }

    #[test]
    fn ok_status_is_success() {
        let (url, paths) = one_shot_server("200 OK");
        let mut actuator = HttpActuator::new(&url, Duration::from_secs(2)).unwrap();

        assert_eq!(actuator.send(Command::Right), ActuationOutcome::Success);
        assert_eq!(paths.recv().unwrap(), "/right");
    }

    #[test]
    fn other_status_is_remote_error() {
        let (url, _paths) = one_shot_server("503 Service Unavailable");
        let mut actuator = HttpActuator::new(&url, Duration::from_secs(2)).unwrap();

        assert_eq!(actuator.send(Command::Left), ActuationOutcome::RemoteError(503));
    }

    #[test]
    fn unreachable_device_is_connection_error() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let mut actuator =
            HttpActuator::new(&format!("http://{addr}"), Duration::from_millis(500)).unwrap();

        assert!(matches!(
            actuator.send(Command::Stop),
            ActuationOutcome::ConnectionError(_)
        ));
    }

    #[test]
    fn silent_device_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut actuator =
            HttpActuator::new(&format!("http://{addr}"), Duration::from_millis(200)).unwrap();

        let started = std::time::Instant::now();
        let outcome = actuator.send(Command::Left);
        assert!(matches!(outcome, ActuationOutcome::ConnectionError(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(listener);
    }
}
