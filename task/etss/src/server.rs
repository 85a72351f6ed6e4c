// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request handling for a provisioned secure flash.

use crate::config::EtssConfig;
use crate::fs::{file_id, FileStore};
use drv_secure_flash::SecureFlash;
use drv_secure_flash_api::{SecureFlashVendor, SESSION_SLOTS};
use ringbuf::{ringbuf, ringbuf_entry};
use task_etss_api::{
    CreateFlags, EtssError, FileInfo, Reply, Request, MAX_ASSET_SIZE,
    MAX_RANDOM_SIZE, MC_SIZE,
};

/// Bytes moved between the caller and the file store per step.
pub const ASSET_BUFFER_SIZE: usize = 128;

/// Each client context holds one session.
pub const MAX_CLIENTS: usize = SESSION_SLOTS;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    Context { client_id: Option<i32>, app_id: u32 },
    ClientSkipped { client_id: i32, app_id: u32 },
    Request { client_id: i32, op: Op },
    Failed(EtssError),
    WriteOnceRefused(u64),
    ForeignCounter { client_id: i32, mc_id: u8 },
    None,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Op {
    Set,
    Get,
    GetInfo,
    Remove,
    GetPuf,
    GenerateRandom,
    McIncrement,
    McGet,
    Provisioning,
}

impl From<&Request> for Op {
    fn from(r: &Request) -> Self {
        match r {
            Request::Set { .. } => Op::Set,
            Request::Get { .. } => Op::Get,
            Request::GetInfo { .. } => Op::GetInfo,
            Request::Remove { .. } => Op::Remove,
            Request::GetPuf { .. } => Op::GetPuf,
            Request::GenerateRandom { .. } => Op::GenerateRandom,
            Request::McIncrement { .. } => Op::McIncrement,
            Request::McGet { .. } => Op::McGet,
            Request::SecureFlashProvisioning => Op::Provisioning,
        }
    }
}

ringbuf!(Trace, 32, Trace::None);

struct ClientContext {
    /// `None` for the context shared by every caller.
    client_id: Option<i32>,
    /// The one counter this client may move or read.
    mc_id: u32,
    fs: FileStore,
}

pub struct EtssServer<V> {
    flash: SecureFlash<V>,
    contexts: heapless::Vec<ClientContext, MAX_CLIENTS>,
    multi_client: bool,
    asset: [u8; ASSET_BUFFER_SIZE],
}

impl<V: SecureFlashVendor> EtssServer<V> {
    /// Opens a session and a file store for every configured client.
    /// `flash` must already be initialized.
    pub fn new(
        mut flash: SecureFlash<V>,
        config: &EtssConfig<'_>,
    ) -> Result<Self, EtssError> {
        let mut bindings: heapless::Vec<(Option<i32>, u32), MAX_CLIENTS> =
            heapless::Vec::new();
        if config.multi_client {
            for c in config.clients {
                bindings
                    .push((Some(c.client_id), c.app_id))
                    .map_err(|_| EtssError::InsufficientSpace)?;
            }
        } else {
            let _ = bindings.push((None, config.default_app_id));
        }

        let mut contexts = heapless::Vec::new();
        for (client_id, app_id) in bindings {
            let Some(app) = flash.app_data(app_id) else {
                ringbuf_entry!(Trace::ClientSkipped {
                    client_id: client_id.unwrap_or(0),
                    app_id
                });
                continue;
            };
            let arch = flash.profile().architecture;
            let session_id = flash.create_session(app.key_id)?;
            let fs = FileStore::new(
                app_id,
                session_id,
                app.zone_id * arch.zone_size,
                arch.zone_size,
                arch.min_secure_erase_size,
            )?;
            contexts
                .push(ClientContext {
                    client_id,
                    mc_id: app.mc_id,
                    fs,
                })
                .map_err(|_| EtssError::InsufficientSpace)?;
            ringbuf_entry!(Trace::Context { client_id, app_id });
        }

        Ok(Self {
            flash,
            contexts,
            multi_client: config.multi_client,
            asset: [0; ASSET_BUFFER_SIZE],
        })
    }

    pub fn flash(&self) -> &SecureFlash<V> {
        &self.flash
    }

    /// Closes every session and gives the secure flash back.
    pub fn into_flash(mut self) -> SecureFlash<V> {
        for ctx in &self.contexts {
            let _ = self.flash.close_session(ctx.fs.session_id());
        }
        self.flash
    }

    fn context(&self, client_id: i32) -> Result<&ClientContext, EtssError> {
        self.contexts
            .iter()
            .find(|c| !self.multi_client || c.client_id == Some(client_id))
            .ok_or(EtssError::NotPermitted)
    }

    fn store(&self, client_id: i32) -> Result<FileStore, EtssError> {
        Ok(self.context(client_id)?.fs)
    }

    /// `mc_id` if it's the counter bound to the caller's application.
    fn own_counter(&self, client_id: i32, mc_id: u8) -> Result<u32, EtssError> {
        let ctx = self.context(client_id)?;
        if ctx.mc_id != u32::from(mc_id) {
            ringbuf_entry!(Trace::ForeignCounter { client_id, mc_id });
            return Err(EtssError::NotPermitted);
        }
        Ok(ctx.mc_id)
    }

    fn check_uid(uid: u64) -> Result<(), EtssError> {
        if uid == 0 {
            Err(EtssError::InvalidArgument)
        } else {
            Ok(())
        }
    }

    /// Creates or replaces `uid` with `data`.
    pub fn set(
        &mut self,
        client_id: i32,
        uid: u64,
        create_flags: u32,
        data: &[u8],
    ) -> Result<(), EtssError> {
        Self::check_uid(uid)?;
        let flags = CreateFlags::from_bits(create_flags)
            .ok_or(EtssError::NotSupported)?;
        if data.len() > MAX_ASSET_SIZE {
            return Err(EtssError::InvalidArgument);
        }
        let fs = self.store(client_id)?;
        let fid = file_id(client_id, uid);

        if let Some((_, h)) = fs.find(&mut self.flash, &fid)? {
            if CreateFlags::from_bits_retain(h.flags.get())
                .contains(CreateFlags::WRITE_ONCE)
            {
                ringbuf_entry!(Trace::WriteOnceRefused(uid));
                return Err(EtssError::NotPermitted);
            }
        }

        let size = data.len() as u32;
        let mut create = Some((size, flags));
        let mut offset = 0;
        loop {
            let n = (data.len() - offset).min(ASSET_BUFFER_SIZE);
            let chunk = &data[offset..][..n];
            self.asset[..chunk.len()].copy_from_slice(chunk);
            fs.write(
                &mut self.flash,
                &fid,
                create.take(),
                offset as u32,
                &self.asset[..chunk.len()],
            )?;
            offset += chunk.len();
            if offset == data.len() {
                return Ok(());
            }
        }
    }

    /// Reads from `uid` at `offset` into `out`, returning how many bytes
    /// were available. Asking for more than remains is not an error.
    pub fn get(
        &mut self,
        client_id: i32,
        uid: u64,
        offset: u32,
        out: &mut [u8],
    ) -> Result<usize, EtssError> {
        Self::check_uid(uid)?;
        let fs = self.store(client_id)?;
        let fid = file_id(client_id, uid);
        let info = fs.info(&mut self.flash, &fid)?;
        if offset > info.size {
            return Err(EtssError::InvalidArgument);
        }
        let n = out.len().min((info.size - offset) as usize);

        let mut done = 0;
        while done < n {
            let step = (n - done).min(ASSET_BUFFER_SIZE);
            fs.read(
                &mut self.flash,
                &fid,
                offset + done as u32,
                &mut self.asset[..step],
            )?;
            out[done..done + step].copy_from_slice(&self.asset[..step]);
            done += step;
        }
        Ok(n)
    }

    pub fn get_info(
        &mut self,
        client_id: i32,
        uid: u64,
    ) -> Result<FileInfo, EtssError> {
        Self::check_uid(uid)?;
        let fs = self.store(client_id)?;
        fs.info(&mut self.flash, &file_id(client_id, uid))
    }

    pub fn remove(
        &mut self,
        client_id: i32,
        uid: u64,
    ) -> Result<(), EtssError> {
        Self::check_uid(uid)?;
        let fs = self.store(client_id)?;
        let fid = file_id(client_id, uid);
        let info = fs.info(&mut self.flash, &fid)?;
        if info.flags.contains(CreateFlags::WRITE_ONCE) {
            ringbuf_entry!(Trace::WriteOnceRefused(uid));
            return Err(EtssError::NotPermitted);
        }
        fs.delete(&mut self.flash, &fid)
    }

    /// PUF-derived bytes, bound to the caller's client id.
    pub fn get_puf(
        &mut self,
        client_id: i32,
        out: &mut [u8],
    ) -> Result<(), EtssError> {
        if out.is_empty() || out.len() > MAX_RANDOM_SIZE {
            return Err(EtssError::InvalidArgument);
        }
        self.store(client_id)?;
        Ok(self.flash.get_puf(&client_id.to_le_bytes(), out)?)
    }

    pub fn generate_random(&mut self, out: &mut [u8]) -> Result<(), EtssError> {
        if out.is_empty() || out.len() > MAX_RANDOM_SIZE {
            return Err(EtssError::InvalidArgument);
        }
        Ok(self.flash.get_trng(out)?)
    }

    /// Bumps the caller's own counter. Other applications' counters are
    /// off limits.
    pub fn mc_increment(
        &mut self,
        client_id: i32,
        mc_id: u8,
    ) -> Result<(), EtssError> {
        let mc = self.own_counter(client_id, mc_id)?;
        Ok(self.flash.increase_mc(mc)?)
    }

    pub fn mc_get(
        &mut self,
        client_id: i32,
        mc_id: u8,
        out: &mut [u8],
    ) -> Result<usize, EtssError> {
        if out.len() < MC_SIZE {
            return Err(EtssError::InvalidArgument);
        }
        let mc = self.own_counter(client_id, mc_id)?;
        Ok(self.flash.get_mc(mc, out)?)
    }

    /// Decodes one request from `client_id`, executes it and encodes the
    /// reply into `reply`, returning its length. Failures are encoded as
    /// [`Reply::Failed`] with nothing else attached.
    pub fn handle(
        &mut self,
        client_id: i32,
        request: &[u8],
        reply: &mut [u8],
    ) -> usize {
        match self.dispatch(client_id, request, reply) {
            Ok(n) => n,
            Err(e) => {
                ringbuf_entry!(Trace::Failed(e));
                failure(reply, e)
            }
        }
    }

    fn dispatch(
        &mut self,
        client_id: i32,
        request: &[u8],
        reply: &mut [u8],
    ) -> Result<usize, EtssError> {
        let (req, trailer) = task_etss_api::deserialize::<Request>(request)?;
        ringbuf_entry!(Trace::Request {
            client_id,
            op: Op::from(&req)
        });

        let done = |reply: &mut [u8]| {
            task_etss_api::serialize(reply, &Reply::Done, &[])
        };
        match req {
            Request::Set { uid, create_flags } => {
                self.set(client_id, uid, create_flags, trailer)?;
                done(reply)
            }
            Request::Get { uid, offset, size } => {
                let want = (size as usize).min(MAX_ASSET_SIZE);
                task_etss_api::serialize_with(reply, &Reply::Data, |out| {
                    let dest =
                        out.get_mut(..want).ok_or(EtssError::BadMessage)?;
                    self.get(client_id, uid, offset, dest)
                })
            }
            Request::GetInfo { uid } => {
                let info = self.get_info(client_id, uid)?;
                task_etss_api::serialize(
                    reply,
                    &Reply::Info {
                        size: info.size,
                        flags: info.flags.bits(),
                    },
                    &[],
                )
            }
            Request::Remove { uid } => {
                self.remove(client_id, uid)?;
                done(reply)
            }
            Request::GetPuf { size } => {
                task_etss_api::serialize_with(reply, &Reply::Data, |out| {
                    let dest = out
                        .get_mut(..usize::from(size))
                        .ok_or(EtssError::InvalidArgument)?;
                    self.get_puf(client_id, dest)?;
                    Ok(dest.len())
                })
            }
            Request::GenerateRandom { size } => {
                task_etss_api::serialize_with(reply, &Reply::Data, |out| {
                    let dest = out
                        .get_mut(..usize::from(size))
                        .ok_or(EtssError::InvalidArgument)?;
                    self.generate_random(dest)?;
                    Ok(dest.len())
                })
            }
            Request::McIncrement { mc_id } => {
                self.mc_increment(client_id, mc_id)?;
                done(reply)
            }
            Request::McGet { mc_id, size } => {
                task_etss_api::serialize_with(reply, &Reply::Data, |out| {
                    let dest = out
                        .get_mut(..usize::from(size).min(MC_SIZE))
                        .ok_or(EtssError::BadMessage)?;
                    self.mc_get(client_id, mc_id, dest)
                })
            }
            // Only offered before the part has been provisioned.
            Request::SecureFlashProvisioning => Err(EtssError::NotPermitted),
        }
    }
}

/// Encodes a failure reply. A reply buffer too small for even that is a
/// caller bug; nothing is sent.
pub(crate) fn failure(reply: &mut [u8], e: EtssError) -> usize {
    task_etss_api::serialize(reply, &Reply::Failed { code: e.into() }, &[])
        .unwrap_or(0)
}
