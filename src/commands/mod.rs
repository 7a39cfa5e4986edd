//! # Commands Module
//!
//! Entry points behind the three `riftgate` subcommands:
//!
//! ## `send`
//! Stages a file or folder (folders are zipped), registers it with the
//! rendezvous server, prints the code and streams the payload once the
//! receiver is ready.
//!
//! ## `receive`
//! Joins the session behind a code, writes the payload into the output
//! directory and unpacks folders.
//!
//! ## `relay`
//! Runs the rendezvous server: accepts TLS connections, pairs uploaders with
//! downloaders and relays bytes between them.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::client::Notifier;

pub mod receive;
pub mod relay;
pub mod send;

/// Terminal notifier: a spinner while waiting, a byte bar while transferring
pub struct ProgressNotifier {
    bar: ProgressBar,
}

impl ProgressNotifier {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.enable_steady_tick(Duration::from_millis(100));
        ProgressNotifier { bar }
    }
}

impl Default for ProgressNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for ProgressNotifier {
    fn status(&self, line: &str) {
        self.bar.suspend(|| println!("{}", line));
    }

    fn transfer_started(&self, total_bytes: u64) {
        let style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.black}] {bytes}/{total_bytes} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        self.bar.set_style(style);
        self.bar.set_length(total_bytes);
        self.bar.set_position(0);
        self.bar.set_message("");
    }

    fn progress(&self, bytes: u64) {
        self.bar.set_position(bytes);
    }

    fn transfer_finished(&self) {
        self.bar.finish_with_message("done");
    }
}

impl Drop for ProgressNotifier {
    fn drop(&mut self) {
        if !self.bar.is_finished() {
            self.bar.finish_and_clear();
        }
    }
}
