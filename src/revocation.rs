//! Certificate revocation store
//!
//! Organizations submit their revocation lists in bulk; each entry lands
//! under a content-addressed key derived from the submitting MSP and the
//! certificate serial, overwriting any prior entry. The guard is read-only
//! and not wired into the purchase flow; deployments that want revocation
//! to gate purchases call it themselves.

use tracing::debug;

use crate::codec;
use crate::engine::Engine;
use crate::error::{Error, OpResult};
use crate::host::Host;
use crate::keys::{self, EntityType};
use crate::model::{CrlEntry, RevokedCertificate};

impl<H: Host> Engine<H> {
    /// Stores every entry of a pre-parsed revocation list under the
    /// caller's MSP. Returns how many entries were written.
    pub fn update_crl(&self, entries: &[CrlEntry]) -> Result<usize, Error> {
        const OP: &str = "UpdateCRL";

        let msp_id = self.host.caller_msp_id().op(OP)?;
        debug!(%msp_id, entries = entries.len(), "storing revocation list");

        for entry in entries {
            let hash = keys::certificate_key(&msp_id, &entry.serial_number);
            let revoked = RevokedCertificate {
                msp_id: msp_id.clone(),
                serial_number: entry.serial_number.clone(),
                revocation_time: entry.revocation_time.clone(),
                key: hash.clone(),
            };

            let key = keys::state_key(EntityType::RevokedCert, &[&hash]);
            let bytes = codec::encode_record(&revoked).op(OP)?;
            self.host.put(&key, bytes).op(OP)?;
        }

        let count = entries.len();
        let payload =
            minicbor::to_vec(count as u64).map_err(|e| {
                Error::new(OP, crate::codec::CodecError::Encode(e.to_string()))
            })?;
        self.host.emit_event("UpdateCRL", payload);

        Ok(count)
    }

    /// Looks up a revoked certificate by its content-addressed key.
    pub fn revoked_certificate(
        &self,
        cert_key: &str,
    ) -> Result<Option<RevokedCertificate>, Error> {
        const OP: &str = "GetRevokedCert";

        let key = keys::state_key(EntityType::RevokedCert, &[cert_key]);
        match self.host.get(&key).op(OP)? {
            Some(bytes) => Ok(Some(codec::decode_record(&bytes).op(OP)?)),
            None => Ok(None),
        }
    }

    pub fn get_revoked_certificates(&self) -> Result<Vec<RevokedCertificate>, Error> {
        const OP: &str = "GetRevokedCertificates";

        let entries = self
            .host
            .iterate_prefix(&keys::prefix(EntityType::RevokedCert))
            .op(OP)?;

        entries
            .iter()
            .map(|(_, bytes)| codec::decode_record(bytes).op(OP))
            .collect()
    }

    /// Fails with an authorization error when the certificate behind
    /// `cert_key` has been revoked by `msp_id`.
    pub fn assert_not_revoked_certificate(
        &self,
        cert_key: &str,
        msp_id: &str,
    ) -> Result<(), Error> {
        const OP: &str = "AssertNotRevokedCertificate";

        match self.revoked_certificate(cert_key)? {
            Some(revoked) if revoked.msp_id == msp_id => Err(Error::unauthorized(
                OP,
                "user's certificate is revoked",
            )),
            _ => Ok(()),
        }
    }
}
