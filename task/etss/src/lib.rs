// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! External trusted secure storage (ETSS) task.
//!
//! The task owns the secure flash stack and serves UID-keyed storage, PUF
//! and random bytes, and monotonic counters to its clients, one request at a
//! time. Startup decides which of two loops runs:
//!
//! - a provisioned part gets the full [`EtssServer`];
//! - a blank part gets a loop that accepts nothing but a provisioning blob,
//!   and once that succeeds, asks for a system reset. The task never tries
//!   to come up in place after provisioning.

#![cfg_attr(not(test), no_std)]

use drv_secure_flash::SecureFlash;
use drv_secure_flash_api::{SecureFlashError, SecureFlashVendor};
use ringbuf::{ringbuf, ringbuf_entry};
use task_etss_api::{
    EtssError, Reply, Request, MAX_REPLY_SIZE, MAX_REQUEST_SIZE,
};

pub mod config;
pub mod fs;
pub mod server;

pub use crate::config::{ClientBinding, EtssConfig, CONFIG};
pub use crate::server::EtssServer;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    Ready,
    NeedsProvisioning,
    StartFailed(EtssError),
    Truncated(usize),
    ProvisionRejected(EtssError),
    ProvisionAccepted,
    Refused { client_id: i32 },
    ResetRequested,
    None,
}

ringbuf!(Trace, 16, Trace::None);

/// Where requests come from and replies go.
pub trait Inbox {
    /// Waits for the next request and copies it into `buf`, returning the
    /// caller's client id and the request length. `None` means no more
    /// requests will arrive.
    fn recv(&mut self, buf: &mut [u8]) -> Option<(i32, usize)>;

    fn reply(&mut self, client_id: i32, reply: &[u8]);

    /// Asks for a full system reset. Doesn't return on hardware.
    fn request_reset(&mut self);
}

pub enum Startup<V> {
    Ready(EtssServer<V>),
    NeedsProvisioning(SecureFlash<V>),
}

/// How a loop ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Exit {
    /// The inbox ran dry.
    Closed,
    /// Provisioning succeeded and a reset has been requested.
    Reset,
}

/// Initializes the secure flash and picks the loop to run.
pub fn start<V: SecureFlashVendor>(
    mut flash: SecureFlash<V>,
    config: &EtssConfig<'_>,
) -> Result<Startup<V>, EtssError> {
    match flash.init() {
        Ok(()) => {
            ringbuf_entry!(Trace::Ready);
            Ok(Startup::Ready(EtssServer::new(flash, config)?))
        }
        Err(SecureFlashError::Unprovisioned) => {
            ringbuf_entry!(Trace::NeedsProvisioning);
            Ok(Startup::NeedsProvisioning(flash))
        }
        Err(e) => Err(e.into()),
    }
}

fn recv<I: Inbox>(inbox: &mut I, buf: &mut [u8]) -> Option<(i32, usize)> {
    let (client_id, len) = inbox.recv(buf)?;
    if len > buf.len() {
        ringbuf_entry!(Trace::Truncated(len));
    }
    Some((client_id, len.min(buf.len())))
}

/// Serves requests until the inbox closes.
pub fn serve<V: SecureFlashVendor, I: Inbox>(
    server: &mut EtssServer<V>,
    inbox: &mut I,
) -> Exit {
    let mut request = [0u8; MAX_REQUEST_SIZE];
    let mut reply = [0u8; MAX_REPLY_SIZE];
    while let Some((client_id, len)) = recv(inbox, &mut request) {
        let n = server.handle(client_id, &request[..len], &mut reply);
        inbox.reply(client_id, &reply[..n]);
    }
    Exit::Closed
}

/// Accepts only provisioning requests. On the first one that succeeds,
/// replies, requests a reset and returns.
pub fn provisioning_loop<V: SecureFlashVendor, I: Inbox>(
    flash: &mut SecureFlash<V>,
    inbox: &mut I,
) -> Exit {
    let mut request = [0u8; MAX_REQUEST_SIZE];
    let mut reply = [0u8; MAX_REPLY_SIZE];
    while let Some((client_id, len)) = recv(inbox, &mut request) {
        let r = match task_etss_api::deserialize::<Request>(&request[..len]) {
            Ok((Request::SecureFlashProvisioning, blob)) => {
                flash.write_provision(blob).map_err(EtssError::from)
            }
            Ok(_) => {
                ringbuf_entry!(Trace::Refused { client_id });
                Err(EtssError::Unprovisioned)
            }
            Err(e) => Err(e),
        };
        let accepted = r.is_ok();
        match r {
            Ok(()) => ringbuf_entry!(Trace::ProvisionAccepted),
            Err(EtssError::Unprovisioned) => (),
            Err(e) => ringbuf_entry!(Trace::ProvisionRejected(e)),
        }

        let n = task_etss_api::serialize(&mut reply, &Reply::from(r), &[])
            .unwrap_or(0);
        inbox.reply(client_id, &reply[..n]);
        if accepted {
            ringbuf_entry!(Trace::ResetRequested);
            inbox.request_reset();
            return Exit::Reset;
        }
    }
    Exit::Closed
}

/// Answers every request with `e`. Used when the secure flash can't be
/// brought up at all.
fn refuse_all<I: Inbox>(inbox: &mut I, e: EtssError) -> Exit {
    let mut request = [0u8; MAX_REQUEST_SIZE];
    let mut reply = [0u8; MAX_REPLY_SIZE];
    while let Some((client_id, _)) = recv(inbox, &mut request) {
        let n = server::failure(&mut reply, e);
        inbox.reply(client_id, &reply[..n]);
    }
    Exit::Closed
}

/// Task body.
pub fn run<V: SecureFlashVendor, I: Inbox>(
    flash: SecureFlash<V>,
    config: &EtssConfig<'_>,
    inbox: &mut I,
) -> Exit {
    match start(flash, config) {
        Ok(Startup::Ready(mut server)) => serve(&mut server, inbox),
        Ok(Startup::NeedsProvisioning(mut flash)) => {
            provisioning_loop(&mut flash, inbox)
        }
        Err(e) => {
            ringbuf_entry!(Trace::StartFailed(e));
            refuse_all(inbox, e)
        }
    }
}

#[cfg(test)]
mod tests;
