// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::*;
use drv_mock_mx75::sfpi::{APP_A, APP_B};
use drv_mock_mx75::{MockMx75, ProvisionBuilder};
use drv_secure_flash::Device;
use drv_secure_flash_crypto::SoftCrypto;
use proptest::prelude::*;
use rand_chacha::ChaCha20Rng;
use rand_core::SeedableRng;
use std::collections::VecDeque;
use task_etss_api::{
    CreateFlags, Etss, Transport, MAX_ASSET_SIZE, MAX_RANDOM_SIZE, MC_SIZE,
};

pub(crate) type Vendor = Device<MockMx75, SoftCrypto<ChaCha20Rng>>;

const ALICE: i32 = -1;
const BOB: i32 = -2;

const TWO_CLIENTS: EtssConfig<'static> = EtssConfig {
    multi_client: true,
    default_app_id: APP_A,
    clients: &[
        ClientBinding {
            client_id: ALICE,
            app_id: APP_A,
        },
        ClientBinding {
            client_id: BOB,
            app_id: APP_B,
        },
    ],
};

const SHARED: EtssConfig<'static> = EtssConfig {
    multi_client: false,
    default_app_id: APP_A,
    clients: &[],
};

fn blank_flash() -> (MockMx75, SecureFlash<Vendor>) {
    let dev = MockMx75::default();
    let crypto = SoftCrypto::new(ChaCha20Rng::seed_from_u64(11));
    let flash = SecureFlash::probe(dev.clone(), crypto).unwrap();
    (dev, flash)
}

pub(crate) fn provisioned_flash() -> (MockMx75, SecureFlash<Vendor>) {
    let (dev, mut flash) = blank_flash();
    assert_eq!(flash.init(), Err(SecureFlashError::Unprovisioned));
    flash
        .write_provision(&ProvisionBuilder::standard().build())
        .unwrap();
    flash.init().unwrap();
    (dev, flash)
}

fn server(config: &EtssConfig<'_>) -> (MockMx75, EtssServer<Vendor>) {
    let (dev, mut flash) = blank_flash();
    flash
        .write_provision(&ProvisionBuilder::standard().build())
        .unwrap();
    match start(flash, config).unwrap() {
        Startup::Ready(server) => (dev, server),
        Startup::NeedsProvisioning(_) => panic!("part still blank"),
    }
}

/// Calls straight into a server as one fixed client.
struct Direct<'a> {
    server: &'a mut EtssServer<Vendor>,
    client_id: i32,
}

impl Transport for Direct<'_> {
    fn call(
        &mut self,
        request: &[u8],
        reply: &mut [u8],
    ) -> Result<usize, EtssError> {
        Ok(self.server.handle(self.client_id, request, reply))
    }
}

fn client(server: &mut EtssServer<Vendor>, client_id: i32) -> Etss<Direct<'_>> {
    Etss::new(Direct { server, client_id })
}

#[derive(Default)]
struct Queue {
    requests: VecDeque<(i32, Vec<u8>)>,
    replies: Vec<(i32, Vec<u8>)>,
    resets: usize,
}

impl Queue {
    fn push(&mut self, client_id: i32, req: Request, trailer: &[u8]) {
        let mut buf = [0; MAX_REQUEST_SIZE];
        let n = task_etss_api::serialize(&mut buf, &req, trailer).unwrap();
        self.requests.push_back((client_id, buf[..n].to_vec()));
    }

    fn reply(&self, i: usize) -> (i32, Reply) {
        let (client_id, raw) = &self.replies[i];
        let (reply, _) = task_etss_api::deserialize::<Reply>(raw).unwrap();
        (*client_id, reply)
    }
}

impl Inbox for Queue {
    fn recv(&mut self, buf: &mut [u8]) -> Option<(i32, usize)> {
        let (client_id, req) = self.requests.pop_front()?;
        buf[..req.len()].copy_from_slice(&req);
        Some((client_id, req.len()))
    }

    fn reply(&mut self, client_id: i32, reply: &[u8]) {
        self.replies.push((client_id, reply.to_vec()));
    }

    fn request_reset(&mut self) {
        self.resets += 1;
    }
}

fn failed(e: EtssError) -> Reply {
    Reply::Failed { code: e.into() }
}

#[test]
fn store_and_fetch() {
    let (_, mut server) = server(&TWO_CLIENTS);
    let mut etss = client(&mut server, ALICE);

    etss.set(42, b"hello", CreateFlags::empty()).unwrap();
    let info = etss.get_info(42).unwrap();
    assert_eq!(info.size, 5);
    assert_eq!(info.flags, CreateFlags::empty());

    let mut out = [0; 16];
    assert_eq!(etss.get(42, 0, &mut out).unwrap(), 5);
    assert_eq!(&out[..5], b"hello");
    assert_eq!(etss.get(42, 3, &mut out).unwrap(), 2);
    assert_eq!(&out[..2], b"lo");
    assert_eq!(etss.get(42, 5, &mut out).unwrap(), 0);

    etss.set(42, b"bye", CreateFlags::NO_CONFIDENTIALITY).unwrap();
    assert_eq!(etss.get(42, 0, &mut out).unwrap(), 3);
    assert_eq!(&out[..3], b"bye");

    etss.remove(42).unwrap();
    assert_eq!(etss.get_info(42), Err(EtssError::DoesNotExist));
    assert_eq!(etss.get(42, 0, &mut out), Err(EtssError::DoesNotExist));
    assert_eq!(etss.remove(42), Err(EtssError::DoesNotExist));
}

#[test]
fn write_once_sticks() {
    let (_, mut server) = server(&TWO_CLIENTS);
    let mut etss = client(&mut server, ALICE);

    etss.set(1, b"forever", CreateFlags::WRITE_ONCE).unwrap();
    assert_eq!(
        etss.set(1, b"again", CreateFlags::empty()),
        Err(EtssError::NotPermitted)
    );
    assert_eq!(etss.remove(1), Err(EtssError::NotPermitted));

    let mut out = [0; 7];
    etss.get(1, 0, &mut out).unwrap();
    assert_eq!(&out, b"forever");
}

#[test]
fn argument_checks() {
    let (_, mut server) = server(&TWO_CLIENTS);
    let mut etss = client(&mut server, ALICE);
    let mut out = [0; 4];

    assert_eq!(
        etss.set(0, b"x", CreateFlags::empty()),
        Err(EtssError::InvalidArgument)
    );
    assert_eq!(
        etss.set(2, b"x", CreateFlags::from_bits_retain(0x80)),
        Err(EtssError::NotSupported)
    );
    assert_eq!(etss.get_info(0), Err(EtssError::InvalidArgument));

    etss.set(2, b"abc", CreateFlags::empty()).unwrap();
    assert_eq!(etss.get(2, 4, &mut out), Err(EtssError::InvalidArgument));

    assert_eq!(etss.get_puf(&mut []), Err(EtssError::InvalidArgument));
    assert_eq!(
        etss.generate_random(&mut [0; MAX_RANDOM_SIZE + 1]),
        Err(EtssError::InvalidArgument)
    );
    assert_eq!(etss.mc_get(0, &mut [0; 2]), Err(EtssError::InvalidArgument));
    drop(etss);

    // Too big to even encode as a request.
    assert_eq!(
        server.set(ALICE, 2, 0, &[0; MAX_ASSET_SIZE + 1]),
        Err(EtssError::InvalidArgument)
    );
}

#[test]
fn largest_asset_spans_chunks() {
    let (_, mut server) = server(&TWO_CLIENTS);
    let data: Vec<u8> = (0..MAX_ASSET_SIZE).map(|i| i as u8).collect();
    let mut etss = client(&mut server, ALICE);
    etss.set(3, &data, CreateFlags::empty()).unwrap();

    let mut out = vec![0; MAX_ASSET_SIZE];
    assert_eq!(etss.get(3, 0, &mut out).unwrap(), MAX_ASSET_SIZE);
    assert_eq!(out, data);
}

#[test]
fn clients_are_isolated() {
    let (dev, mut server) = server(&TWO_CLIENTS);
    client(&mut server, ALICE)
        .set(9, b"alice", CreateFlags::empty())
        .unwrap();
    client(&mut server, BOB)
        .set(9, b"bob", CreateFlags::empty())
        .unwrap();

    let mut out = [0; 8];
    assert_eq!(client(&mut server, ALICE).get(9, 0, &mut out).unwrap(), 5);
    assert_eq!(&out[..5], b"alice");
    assert_eq!(client(&mut server, BOB).get(9, 0, &mut out).unwrap(), 3);
    assert_eq!(&out[..3], b"bob");

    // Each lands in its own zone.
    let image = dev.flash();
    assert_eq!(&image[..4], b"ETSF");
    assert_eq!(&image[8192..8196], b"ETSF");

    let mut stranger = client(&mut server, 7);
    assert_eq!(stranger.get_info(9), Err(EtssError::NotPermitted));
    assert_eq!(stranger.get_puf(&mut out), Err(EtssError::NotPermitted));
}

#[test]
fn shared_mode_serves_every_caller() {
    let (_, mut server) = server(&SHARED);
    client(&mut server, ALICE)
        .set(5, b"one", CreateFlags::empty())
        .unwrap();
    client(&mut server, 1234)
        .set(5, b"two", CreateFlags::empty())
        .unwrap();

    let mut out = [0; 3];
    client(&mut server, ALICE).get(5, 0, &mut out).unwrap();
    assert_eq!(&out, b"one");
    client(&mut server, 1234).get(5, 0, &mut out).unwrap();
    assert_eq!(&out, b"two");
}

#[test]
fn unprovisioned_app_gets_no_context() {
    const THREE: EtssConfig<'static> = EtssConfig {
        multi_client: true,
        default_app_id: APP_A,
        clients: &[
            ClientBinding {
                client_id: ALICE,
                app_id: APP_A,
            },
            ClientBinding {
                client_id: -3,
                app_id: 0x999,
            },
        ],
    };
    let (dev, mut server) = server(&THREE);
    assert_eq!(dev.open_sessions(), 1);
    client(&mut server, ALICE)
        .set(1, b"a", CreateFlags::empty())
        .unwrap();
    assert_eq!(
        client(&mut server, -3).get_info(1),
        Err(EtssError::NotPermitted)
    );
}

#[test]
fn puf_random_and_counters() {
    let (dev, mut server) = server(&TWO_CLIENTS);
    let mut etss = client(&mut server, BOB);

    let mut puf = [0; 32];
    assert_eq!(etss.get_puf(&mut puf).unwrap(), 32);
    assert_ne!(puf, [0; 32]);

    let (mut r1, mut r2) = ([0; 16], [0; 16]);
    assert_eq!(etss.generate_random(&mut r1).unwrap(), 16);
    etss.generate_random(&mut r2).unwrap();
    assert_ne!(r1, r2);

    let mut mc = [0; 8];
    assert_eq!(etss.mc_get(1, &mut mc).unwrap(), MC_SIZE);
    assert_eq!(u32::from_le_bytes(mc[..4].try_into().unwrap()), 100);
    etss.mc_increment(1).unwrap();
    etss.mc_get(1, &mut mc).unwrap();
    assert_eq!(u32::from_le_bytes(mc[..4].try_into().unwrap()), 101);
    drop(etss);
    assert_eq!(dev.mc(1), 101);
}

#[test]
fn clients_only_reach_their_own_counter() {
    let (dev, mut server) = server(&TWO_CLIENTS);
    let mc0 = dev.mc(0);

    let mut alice = client(&mut server, ALICE);
    assert_eq!(alice.mc_increment(1), Err(EtssError::NotPermitted));
    assert_eq!(alice.mc_get(1, &mut [0; 4]), Err(EtssError::NotPermitted));
    alice.mc_increment(0).unwrap();
    drop(alice);
    assert_eq!(dev.mc(1), 100);
    assert_eq!(dev.mc(0), mc0 + 1);

    let mut bob = client(&mut server, BOB);
    assert_eq!(bob.mc_get(0, &mut [0; 4]), Err(EtssError::NotPermitted));
    assert_eq!(bob.mc_increment(0), Err(EtssError::NotPermitted));
    drop(bob);
    assert_eq!(dev.mc(0), mc0 + 1);

    assert_eq!(server.mc_increment(-99, 0), Err(EtssError::NotPermitted));
}

#[test]
fn provisioning_request_refused_once_provisioned() {
    let (_, mut server) = server(&TWO_CLIENTS);
    let blob = ProvisionBuilder::standard().build();
    assert_eq!(
        client(&mut server, ALICE).secure_flash_provisioning(&blob),
        Err(EtssError::NotPermitted)
    );
}

#[test]
fn garbage_request_is_bad_message() {
    let (_, mut server) = server(&TWO_CLIENTS);
    let mut reply = [0; MAX_REPLY_SIZE];
    let n = server.handle(ALICE, &[0xee, 1, 2], &mut reply);
    let (r, rest) = task_etss_api::deserialize::<Reply>(&reply[..n]).unwrap();
    assert_eq!(r, failed(EtssError::BadMessage));
    assert!(rest.is_empty());
}

#[test]
fn serve_answers_in_order() {
    let (_, mut server) = server(&TWO_CLIENTS);
    let mut q = Queue::default();
    q.push(ALICE, Request::Set { uid: 4, create_flags: 0 }, b"data");
    q.push(BOB, Request::GetInfo { uid: 4 }, &[]);
    q.push(ALICE, Request::GetInfo { uid: 4 }, &[]);

    assert_eq!(serve(&mut server, &mut q), Exit::Closed);
    assert_eq!(q.reply(0), (ALICE, Reply::Done));
    assert_eq!(q.reply(1), (BOB, failed(EtssError::DoesNotExist)));
    assert_eq!(q.reply(2), (ALICE, Reply::Info { size: 4, flags: 0 }));
    assert_eq!(q.resets, 0);
}

#[test]
fn blank_part_provisions_then_resets() {
    let (dev, flash) = blank_flash();
    let Ok(Startup::NeedsProvisioning(mut flash)) = start(flash, &TWO_CLIENTS)
    else {
        panic!("expected provisioning mode");
    };

    let mut q = Queue::default();
    q.push(ALICE, Request::GetInfo { uid: 1 }, &[]);
    let mut corrupt = ProvisionBuilder::standard().build();
    corrupt[0] = b'X';
    q.push(ALICE, Request::SecureFlashProvisioning, &corrupt);
    q.push(
        ALICE,
        Request::SecureFlashProvisioning,
        &ProvisionBuilder::standard().build(),
    );
    q.push(ALICE, Request::GetInfo { uid: 1 }, &[]);

    assert_eq!(provisioning_loop(&mut flash, &mut q), Exit::Reset);
    assert_eq!(q.reply(0), (ALICE, failed(EtssError::Unprovisioned)));
    assert_eq!(q.reply(1), (ALICE, failed(EtssError::ProvisioningFailed)));
    assert_eq!(q.reply(2), (ALICE, Reply::Done));
    assert_eq!(q.replies.len(), 3);
    assert_eq!(q.resets, 1);
    assert_eq!(q.requests.len(), 1);

    // After the reset the stack comes back up on the same part.
    let (bus, crypto) = flash.into_parts();
    let flash = SecureFlash::probe(bus, crypto).unwrap();
    let Ok(Startup::Ready(mut server)) = start(flash, &TWO_CLIENTS) else {
        panic!("expected a ready server");
    };
    assert_eq!(dev.open_sessions(), 2);
    client(&mut server, ALICE)
        .set(1, b"up", CreateFlags::empty())
        .unwrap();
}

#[test]
fn corrupt_provisioning_changes_nothing() {
    let (dev, mut flash) = blank_flash();
    let mut q = Queue::default();
    let mut corrupt = ProvisionBuilder::standard().build();
    corrupt[0] = b'X';
    q.push(BOB, Request::SecureFlashProvisioning, &corrupt);

    assert_eq!(provisioning_loop(&mut flash, &mut q), Exit::Closed);
    assert_eq!(q.reply(0), (BOB, failed(EtssError::ProvisioningFailed)));
    assert_eq!(q.resets, 0);
    assert!(dev.provision_area().iter().all(|&b| b == 0xff));
    assert_eq!(flash.init(), Err(SecureFlashError::Unprovisioned));
}

#[test]
fn run_refuses_everything_when_the_part_is_gone() {
    let (dev, flash) = blank_flash();
    dev.set_bus_fault(true);
    let mut q = Queue::default();
    q.push(ALICE, Request::GetInfo { uid: 1 }, &[]);
    q.push(BOB, Request::SecureFlashProvisioning, &[]);

    assert_eq!(run(flash, &TWO_CLIENTS, &mut q), Exit::Closed);
    assert_eq!(q.reply(0), (ALICE, failed(EtssError::StorageFailure)));
    assert_eq!(q.reply(1), (BOB, failed(EtssError::StorageFailure)));
}

#[test]
fn run_serves_a_provisioned_part() {
    let (_, mut flash) = blank_flash();
    flash
        .write_provision(&ProvisionBuilder::standard().build())
        .unwrap();
    let mut q = Queue::default();
    q.push(BOB, Request::McGet { mc_id: 1, size: 4 }, &[]);

    assert_eq!(run(flash, &TWO_CLIENTS, &mut q), Exit::Closed);
    let (_, raw) = &q.replies[0];
    let (r, data) = task_etss_api::deserialize::<Reply>(raw).unwrap();
    assert_eq!(r, Reply::Data);
    assert_eq!(data, &100u32.to_le_bytes());
}

#[test]
fn into_flash_closes_sessions() {
    let (dev, server) = server(&TWO_CLIENTS);
    assert_eq!(dev.open_sessions(), 2);
    let flash = server.into_flash();
    assert_eq!(dev.open_sessions(), 0);
    assert!(flash.is_initialized());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn assets_read_back(
        uid in 1u64..,
        data in proptest::collection::vec(any::<u8>(), 0..=MAX_ASSET_SIZE),
        offset in 0usize..=MAX_ASSET_SIZE,
    ) {
        let (_, mut server) = server(&TWO_CLIENTS);
        let mut etss = client(&mut server, BOB);
        etss.set(uid, &data, CreateFlags::empty()).unwrap();

        let mut out = vec![0; MAX_ASSET_SIZE];
        let r = etss.get(uid, offset as u32, &mut out);
        if offset > data.len() {
            prop_assert_eq!(r, Err(EtssError::InvalidArgument));
        } else {
            let n = r.unwrap();
            prop_assert_eq!(&out[..n], &data[offset..]);
        }
    }
}
