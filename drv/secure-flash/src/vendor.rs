// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Vendor selection by JEDEC id.

use drv_mx75_armorflash::Mx75;
use drv_secure_flash_api::{
    AppData, CipherSuite, CryptoService, LockRequest, SecureFlashError,
    SecureFlashProfile, SecureFlashVendor,
};
use drv_spi_nor::{SpiBus, SpiNor};

/// Every part this stack knows how to drive.
pub enum Device<B, C> {
    Mx75(Mx75<B, C>),
}

type Factory<B, C> = fn(B, C) -> Device<B, C>;

fn mx75<B: SpiBus, C: CryptoService>(bus: B, crypto: C) -> Device<B, C> {
    Device::Mx75(Mx75::new(bus, crypto))
}

/// Reads the JEDEC id and builds the matching vendor driver.
///
/// On an unknown id the bus and crypto service are handed back alongside
/// [`SecureFlashError::Unsupported`].
pub fn probe<B: SpiBus, C: CryptoService>(
    bus: B,
    crypto: C,
) -> Result<Device<B, C>, (SecureFlashError, B, C)> {
    let factories: [([u8; 3], Factory<B, C>); 1] =
        [(drv_mx75_api::JEDEC_ID, mx75::<B, C>)];

    let mut nor = SpiNor::new(bus);
    let id = match nor.read_id() {
        Ok(id) => id,
        Err(e) => return Err((e.into(), nor.into_inner(), crypto)),
    };
    let bus = nor.into_inner();
    match factories.iter().find(|(jedec, _)| *jedec == id) {
        Some((_, make)) => Ok(make(bus, crypto)),
        None => Err((SecureFlashError::Unsupported, bus, crypto)),
    }
}

impl<B: SpiBus, C: CryptoService> Device<B, C> {
    /// Tears the driver down, returning its bus and crypto service.
    pub fn into_parts(self) -> (B, C) {
        match self {
            Device::Mx75(d) => d.into_parts(),
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $d:ident => $e:expr) => {
        match $self {
            Device::Mx75($d) => $e,
        }
    };
}

impl<B: SpiBus, C: CryptoService> SecureFlashVendor for Device<B, C> {
    fn name(&self) -> &'static str {
        dispatch!(self, d => d.name())
    }

    fn read_sfdp(
        &mut self,
        addr: u32,
        buf: &mut [u8],
    ) -> Result<(), SecureFlashError> {
        dispatch!(self, d => d.read_sfdp(addr, buf))
    }

    fn check_algorithm_support(&self, suite: &CipherSuite) -> bool {
        dispatch!(self, d => d.check_algorithm_support(suite))
    }

    fn init(
        &mut self,
        profile: &SecureFlashProfile,
    ) -> Result<(), SecureFlashError> {
        dispatch!(self, d => d.init(profile))
    }

    fn deinit(&mut self) -> Result<(), SecureFlashError> {
        dispatch!(self, d => d.deinit())
    }

    fn write_provision(&mut self, blob: &[u8]) -> Result<(), SecureFlashError> {
        dispatch!(self, d => d.write_provision(blob))
    }

    fn read_provision(
        &mut self,
        buf: &mut [u8],
    ) -> Result<usize, SecureFlashError> {
        dispatch!(self, d => d.read_provision(buf))
    }

    fn app_data(&self) -> &[AppData] {
        dispatch!(self, d => d.app_data())
    }

    fn create_session(&mut self, key_id: u32) -> Result<u32, SecureFlashError> {
        dispatch!(self, d => d.create_session(key_id))
    }

    fn close_session(
        &mut self,
        session_key_id: u32,
    ) -> Result<(), SecureFlashError> {
        dispatch!(self, d => d.close_session(session_key_id))
    }

    fn secure_read(
        &mut self,
        addr: u32,
        buf: &mut [u8],
        session_key_id: u32,
    ) -> Result<(), SecureFlashError> {
        dispatch!(self, d => d.secure_read(addr, buf, session_key_id))
    }

    fn secure_program(
        &mut self,
        addr: u32,
        data: &[u8],
        session_key_id: u32,
    ) -> Result<(), SecureFlashError> {
        dispatch!(self, d => d.secure_program(addr, data, session_key_id))
    }

    fn secure_erase(
        &mut self,
        addr: u32,
        size: u32,
        session_key_id: u32,
    ) -> Result<(), SecureFlashError> {
        dispatch!(self, d => d.secure_erase(addr, size, session_key_id))
    }

    fn lock_down(
        &mut self,
        lock: &LockRequest,
    ) -> Result<(), SecureFlashError> {
        dispatch!(self, d => d.lock_down(lock))
    }

    fn get_puf(
        &mut self,
        info: &[u8],
        out: &mut [u8],
    ) -> Result<(), SecureFlashError> {
        dispatch!(self, d => d.get_puf(info, out))
    }

    fn get_trng(&mut self, out: &mut [u8]) -> Result<(), SecureFlashError> {
        dispatch!(self, d => d.get_trng(out))
    }

    fn get_mc(
        &mut self,
        mc_id: u32,
        out: &mut [u8],
    ) -> Result<usize, SecureFlashError> {
        dispatch!(self, d => d.get_mc(mc_id, out))
    }

    fn increase_mc(&mut self, mc_id: u32) -> Result<(), SecureFlashError> {
        dispatch!(self, d => d.increase_mc(mc_id))
    }

    fn erase_value(&self) -> u8 {
        dispatch!(self, d => d.erase_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_mock_mx75::MockMx75;
    use drv_secure_flash_crypto::SoftCrypto;
    use drv_spi_nor::SpiError;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    fn crypto() -> SoftCrypto<ChaCha20Rng> {
        SoftCrypto::new(ChaCha20Rng::seed_from_u64(9))
    }

    #[test]
    fn mx75_is_recognized() {
        let dev = match probe(MockMx75::default(), crypto()) {
            Ok(dev) => dev,
            Err((e, _, _)) => panic!("probe failed: {e:?}"),
        };
        assert_eq!(dev.name(), "MX75 ArmorFlash");
        let (_bus, _crypto) = dev.into_parts();
    }

    #[test]
    fn unknown_part_returns_its_bus() {
        struct Other;
        impl SpiBus for Other {
            fn transfer(
                &mut self,
                _tx: &[u8],
                rx: &mut [u8],
            ) -> Result<(), SpiError> {
                rx.fill(0xef);
                Ok(())
            }
        }
        match probe(Other, crypto()) {
            Err((e, Other, _)) => assert_eq!(e, SecureFlashError::Unsupported),
            Ok(_) => panic!("unknown part accepted"),
        }
    }

    #[test]
    fn bus_fault_during_probe() {
        let bus = MockMx75::default();
        bus.set_bus_fault(true);
        match probe(bus, crypto()) {
            Err((e, _, _)) => assert_eq!(e, SecureFlashError::Device),
            Ok(_) => panic!("probe succeeded on a dead bus"),
        }
    }
}
