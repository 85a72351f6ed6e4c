// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client API for the external trusted secure storage (ETSS) task.
//!
//! Messages are a hubpack-encoded [`Request`] or [`Reply`] followed by raw
//! trailing bytes (the asset for `Set`, the blob for provisioning, the
//! returned data for [`Reply::Data`]). The identity of the caller is never
//! part of a message; the transport supplies it to the server.

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;
use drv_secure_flash_api::SecureFlashError;
use hubpack::SerializedSize;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Largest asset a single UID can hold.
pub const MAX_ASSET_SIZE: usize = 512;

/// Largest provisioning blob the task will forward.
pub const MAX_PROVISION_SIZE: usize = drv_secure_flash_api::MAX_PROVISION_SIZE;

/// Largest `GetPuf` or `GenerateRandom` request.
pub const MAX_RANDOM_SIZE: usize = 128;

/// Size of a monotonic counter value.
pub const MC_SIZE: usize = 4;

const MAX_TRAILER: usize = if MAX_ASSET_SIZE > MAX_PROVISION_SIZE {
    MAX_ASSET_SIZE
} else {
    MAX_PROVISION_SIZE
};

/// Buffer size that holds any request.
pub const MAX_REQUEST_SIZE: usize = Request::MAX_SIZE + MAX_TRAILER;
/// Buffer size that holds any reply.
pub const MAX_REPLY_SIZE: usize = Reply::MAX_SIZE + MAX_ASSET_SIZE;

/// Errors returned by the ETSS task. Zero is success on the wire.
#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
pub enum EtssError {
    GenericError = 1,
    NotPermitted,
    NotSupported,
    InvalidArgument,
    DoesNotExist,
    InsufficientSpace,
    StorageFailure,
    /// The message could not be decoded, or the reply did not fit.
    BadMessage,
    /// The secure flash has not been provisioned; only provisioning is
    /// accepted.
    Unprovisioned,
    ProvisioningFailed,
}

impl From<EtssError> for u32 {
    fn from(e: EtssError) -> Self {
        e as u32
    }
}

impl From<u32> for EtssError {
    fn from(code: u32) -> Self {
        EtssError::from_u32(code).unwrap_or(EtssError::GenericError)
    }
}

impl From<hubpack::Error> for EtssError {
    fn from(_: hubpack::Error) -> Self {
        EtssError::BadMessage
    }
}

impl From<SecureFlashError> for EtssError {
    fn from(e: SecureFlashError) -> Self {
        match e {
            SecureFlashError::InvalidArgument => EtssError::InvalidArgument,
            SecureFlashError::Unsupported => EtssError::NotSupported,
            SecureFlashError::IllegalAccess
            | SecureFlashError::Locked
            | SecureFlashError::LockDown => EtssError::NotPermitted,
            SecureFlashError::Unprovisioned
            | SecureFlashError::NotInitialized => EtssError::Unprovisioned,
            SecureFlashError::WriteProvision
            | SecureFlashError::ReadProvision
            | SecureFlashError::KeyProvision => EtssError::ProvisioningFailed,
            SecureFlashError::SessionExhaust => EtssError::InsufficientSpace,
            _ => EtssError::StorageFailure,
        }
    }
}

bitflags! {
    /// Flags given when a UID is created.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct CreateFlags: u32 {
        /// The asset can never be modified or removed.
        const WRITE_ONCE = 1 << 0;
        const NO_CONFIDENTIALITY = 1 << 1;
        const NO_REPLAY_PROTECTION = 1 << 2;
    }
}

/// What `GetInfo` reports. Capacity is not tracked separately from size.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FileInfo {
    pub size: u32,
    pub flags: CreateFlags,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub enum Request {
    /// Followed by the asset.
    Set { uid: u64, create_flags: u32 },
    Get { uid: u64, offset: u32, size: u32 },
    GetInfo { uid: u64 },
    Remove { uid: u64 },
    GetPuf { size: u16 },
    GenerateRandom { size: u16 },
    McIncrement { mc_id: u8 },
    McGet { mc_id: u8, size: u16 },
    /// Followed by an SFPI blob.
    SecureFlashProvisioning,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub enum Reply {
    Done,
    /// Followed by the returned bytes.
    Data,
    Info { size: u32, flags: u32 },
    Failed { code: u32 },
}

impl From<Result<(), EtssError>> for Reply {
    fn from(r: Result<(), EtssError>) -> Self {
        match r {
            Ok(()) => Reply::Done,
            Err(e) => Reply::Failed { code: e.into() },
        }
    }
}

/// Encodes `msg` followed by `trailer` into `out`.
pub fn serialize<T: Serialize>(
    out: &mut [u8],
    msg: &T,
    trailer: &[u8],
) -> Result<usize, EtssError> {
    let n = hubpack::serialize(out, msg)?;
    let end = n
        .checked_add(trailer.len())
        .filter(|&end| end <= out.len())
        .ok_or(EtssError::BadMessage)?;
    out[n..end].copy_from_slice(trailer);
    Ok(end)
}

/// Encodes `msg` and lets `fill` write the trailer in place, returning how
/// many bytes it wrote.
pub fn serialize_with<T: Serialize>(
    out: &mut [u8],
    msg: &T,
    fill: impl FnOnce(&mut [u8]) -> Result<usize, EtssError>,
) -> Result<usize, EtssError> {
    let n = hubpack::serialize(out, msg)?;
    let written = fill(&mut out[n..])?;
    Ok(n + written)
}

/// Splits a message into its header and trailer.
pub fn deserialize<T: DeserializeOwned>(
    buf: &[u8],
) -> Result<(T, &[u8]), EtssError> {
    Ok(hubpack::deserialize(buf)?)
}

/// Carries one request to the ETSS task and its reply back.
pub trait Transport {
    /// Delivers `request` and writes the reply into `reply`, returning its
    /// length.
    fn call(
        &mut self,
        request: &[u8],
        reply: &mut [u8],
    ) -> Result<usize, EtssError>;
}

/// Client stub.
pub struct Etss<T> {
    transport: T,
    request: [u8; MAX_REQUEST_SIZE],
    reply: [u8; MAX_REPLY_SIZE],
}

impl<T: Transport> Etss<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            request: [0; MAX_REQUEST_SIZE],
            reply: [0; MAX_REPLY_SIZE],
        }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn call(
        &mut self,
        req: Request,
        trailer: &[u8],
    ) -> Result<(Reply, &[u8]), EtssError> {
        let n = serialize(&mut self.request, &req, trailer)?;
        let len = self.transport.call(&self.request[..n], &mut self.reply)?;
        let reply = self.reply.get(..len).ok_or(EtssError::BadMessage)?;
        match deserialize::<Reply>(reply)? {
            (Reply::Failed { code }, _) => Err(EtssError::from(code)),
            other => Ok(other),
        }
    }

    fn call_done(
        &mut self,
        req: Request,
        trailer: &[u8],
    ) -> Result<(), EtssError> {
        match self.call(req, trailer)? {
            (Reply::Done, _) => Ok(()),
            _ => Err(EtssError::BadMessage),
        }
    }

    fn call_data(
        &mut self,
        req: Request,
        out: &mut [u8],
    ) -> Result<usize, EtssError> {
        match self.call(req, &[])? {
            (Reply::Data, data) => {
                let dest =
                    out.get_mut(..data.len()).ok_or(EtssError::BadMessage)?;
                dest.copy_from_slice(data);
                Ok(data.len())
            }
            _ => Err(EtssError::BadMessage),
        }
    }

    /// Creates or replaces `uid`.
    pub fn set(
        &mut self,
        uid: u64,
        data: &[u8],
        flags: CreateFlags,
    ) -> Result<(), EtssError> {
        self.call_done(
            Request::Set {
                uid,
                create_flags: flags.bits(),
            },
            data,
        )
    }

    /// Reads up to `out.len()` bytes of `uid` from `offset`, returning how
    /// many were read.
    pub fn get(
        &mut self,
        uid: u64,
        offset: u32,
        out: &mut [u8],
    ) -> Result<usize, EtssError> {
        let size = u32::try_from(out.len())
            .map_err(|_| EtssError::InvalidArgument)?;
        self.call_data(Request::Get { uid, offset, size }, out)
    }

    pub fn get_info(&mut self, uid: u64) -> Result<FileInfo, EtssError> {
        match self.call(Request::GetInfo { uid }, &[])? {
            (Reply::Info { size, flags }, _) => Ok(FileInfo {
                size,
                flags: CreateFlags::from_bits_retain(flags),
            }),
            _ => Err(EtssError::BadMessage),
        }
    }

    pub fn remove(&mut self, uid: u64) -> Result<(), EtssError> {
        self.call_done(Request::Remove { uid }, &[])
    }

    pub fn get_puf(&mut self, out: &mut [u8]) -> Result<usize, EtssError> {
        let size = u16::try_from(out.len())
            .map_err(|_| EtssError::InvalidArgument)?;
        self.call_data(Request::GetPuf { size }, out)
    }

    pub fn generate_random(
        &mut self,
        out: &mut [u8],
    ) -> Result<usize, EtssError> {
        let size = u16::try_from(out.len())
            .map_err(|_| EtssError::InvalidArgument)?;
        self.call_data(Request::GenerateRandom { size }, out)
    }

    /// Bumps monotonic counter `mc_id`, which must be the caller's own.
    pub fn mc_increment(&mut self, mc_id: u8) -> Result<(), EtssError> {
        self.call_done(Request::McIncrement { mc_id }, &[])
    }

    /// Reads monotonic counter `mc_id` into `out`.
    pub fn mc_get(
        &mut self,
        mc_id: u8,
        out: &mut [u8],
    ) -> Result<usize, EtssError> {
        let size = u16::try_from(out.len())
            .map_err(|_| EtssError::InvalidArgument)?;
        self.call_data(Request::McGet { mc_id, size }, out)
    }

    pub fn secure_flash_provisioning(
        &mut self,
        blob: &[u8],
    ) -> Result<(), EtssError> {
        if blob.len() > MAX_PROVISION_SIZE {
            return Err(EtssError::InvalidArgument);
        }
        self.call_done(Request::SecureFlashProvisioning, blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_round_trip_and_degrade() {
        assert_eq!(u32::from(EtssError::GenericError), 1);
        assert_eq!(u32::from(EtssError::NotPermitted), 2);
        assert_eq!(EtssError::from(4), EtssError::InvalidArgument);
        assert_eq!(EtssError::from(0), EtssError::GenericError);
        assert_eq!(EtssError::from(0xdead), EtssError::GenericError);
    }

    #[test]
    fn secure_flash_errors_map_to_policy_codes() {
        assert_eq!(
            EtssError::from(SecureFlashError::IllegalAccess),
            EtssError::NotPermitted
        );
        assert_eq!(
            EtssError::from(SecureFlashError::SecureRead),
            EtssError::StorageFailure
        );
        assert_eq!(
            EtssError::from(SecureFlashError::DeviceBusy),
            EtssError::StorageFailure
        );
        assert_eq!(
            EtssError::from(SecureFlashError::Unprovisioned),
            EtssError::Unprovisioned
        );
    }

    #[test]
    fn variant_index_is_first_byte() {
        let mut buf = [0; MAX_REQUEST_SIZE];
        for (index, req) in [
            Request::Set {
                uid: 1,
                create_flags: 0,
            },
            Request::Get {
                uid: 1,
                offset: 0,
                size: 0,
            },
            Request::GetInfo { uid: 1 },
            Request::Remove { uid: 1 },
            Request::GetPuf { size: 1 },
            Request::GenerateRandom { size: 1 },
            Request::McIncrement { mc_id: 0 },
            Request::McGet { mc_id: 0, size: 4 },
            Request::SecureFlashProvisioning,
        ]
        .into_iter()
        .enumerate()
        {
            serialize(&mut buf, &req, &[]).unwrap();
            assert_eq!(buf[0], index as u8);
        }
    }

    #[test]
    fn trailer_follows_header() {
        let mut buf = [0; 64];
        let req = Request::Set {
            uid: 0x0102,
            create_flags: CreateFlags::WRITE_ONCE.bits(),
        };
        let n = serialize(&mut buf, &req, b"hello").unwrap();
        let (back, rest) = deserialize::<Request>(&buf[..n]).unwrap();
        assert_eq!(back, req);
        assert_eq!(rest, b"hello");

        let mut tiny = [0; 16];
        assert_eq!(
            serialize(&mut tiny, &req, &[0; 8]),
            Err(EtssError::BadMessage)
        );
        assert_eq!(
            deserialize::<Request>(&[0xee]),
            Err(EtssError::BadMessage)
        );
    }

    /// Answers every call from a canned reply and records the request.
    struct Canned {
        reply: Vec<u8>,
        seen: Vec<u8>,
    }

    impl Transport for Canned {
        fn call(
            &mut self,
            request: &[u8],
            reply: &mut [u8],
        ) -> Result<usize, EtssError> {
            self.seen = request.to_vec();
            reply[..self.reply.len()].copy_from_slice(&self.reply);
            Ok(self.reply.len())
        }
    }

    fn canned(reply: Reply, data: &[u8]) -> Etss<Canned> {
        let mut buf = [0; 64];
        let n = serialize(&mut buf, &reply, data).unwrap();
        Etss::new(Canned {
            reply: buf[..n].to_vec(),
            seen: vec![],
        })
    }

    #[test]
    fn stub_surfaces_wire_errors() {
        let mut etss = canned(
            Reply::Failed {
                code: EtssError::NotPermitted.into(),
            },
            &[],
        );
        assert_eq!(etss.remove(9), Err(EtssError::NotPermitted));
        let (req, _) =
            deserialize::<Request>(&etss.transport_mut().seen).unwrap();
        assert_eq!(req, Request::Remove { uid: 9 });
    }

    #[test]
    fn stub_copies_data_out() {
        let mut etss = canned(Reply::Data, b"abc");
        let mut out = [0; 8];
        assert_eq!(etss.get(1, 0, &mut out), Ok(3));
        assert_eq!(&out[..3], b"abc");

        let mut short = [0; 2];
        assert_eq!(
            etss.get(1, 0, &mut short),
            Err(EtssError::BadMessage)
        );
    }

    #[test]
    fn stub_rejects_mismatched_reply() {
        let mut etss = canned(Reply::Done, &[]);
        assert_eq!(etss.get_info(3), Err(EtssError::BadMessage));

        let mut etss = canned(
            Reply::Info {
                size: 5,
                flags: CreateFlags::WRITE_ONCE.bits(),
            },
            &[],
        );
        assert_eq!(
            etss.get_info(3),
            Ok(FileInfo {
                size: 5,
                flags: CreateFlags::WRITE_ONCE
            })
        );
    }
}
