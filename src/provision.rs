//! Fetch-or-generate of the data key, with recovery.
//!
//! States:
//!
//! ```text
//! Fetching ──► Provisioned                 both fragments present and unwrap succeeds
//!    │    ──► Generating ──► Provisioned   no wrapped blob (fresh install or interrupted mint)
//!    │    ──► Corrupted  ──► Generating    mismatch / blob without key / malformed blob
//!    └───────► Recovering ──► Fetching     domain-B store is structurally broken
//! ```
//!
//! `Corrupted` only moves on to `Generating` when recovery is allowed.
//! A new epoch is written to domain B first and domain A second, so a
//! wrapping key without a wrapped blob is a mint that never finished and is
//! completed regardless of the recovery flag.
//! `Recovering` deletes the domain-B database and is entered at most once per
//! call; a second structural failure is unrecoverable.
//!
//! Known limitation: two handles provisioning at the same time against an
//! empty store can both mint an epoch. The last write wins and the other
//! handle's records fail authentication until it is reopened, at which point
//! recovery moves it onto the surviving epoch.

use tracing::{debug, error, warn};

use crate::error::{KeyStoreError, ProvisionError};
use crate::keys::{generate_epoch, unwrap_data_key, DataKey};
use crate::storage::traits::{KvBackend, WrappingKeyStore};
use crate::storage::wrapped_key::WrappedKeyStore;

/// Result of provisioning: the usable data key and whether a new epoch was minted.
#[derive(Debug)]
pub struct ProvisionedKey {
    pub data_key: DataKey,
    pub created: bool,
    /// Identifies the epoch: hex of the wrapped data key blob. The blob is
    /// already public in domain A, and differs for every minted epoch.
    pub epoch_id: String,
}

enum ProvisionState {
    Fetching,
    Generating,
    Corrupted(String),
    Recovering(KeyStoreError),
    Provisioned(ProvisionedKey),
}

enum Fetched {
    Key { data_key: DataKey, wrapped: Vec<u8> },
    Empty,
}

enum Fault {
    /// Domain-B store is broken; only deleting it helps.
    Structural(KeyStoreError),
    /// Fragments are inconsistent; a new epoch fixes it.
    Mismatch(String),
    /// Anything else; not recoverable here.
    Other(String),
}

/// Reads and writes the two key fragments. Borrowed for one provisioning call.
pub struct KeyProvisioner<'a, A: ?Sized, B: ?Sized> {
    domain_a: &'a A,
    domain_b: &'a B,
}

impl<'a, A, B> KeyProvisioner<'a, A, B>
where
    A: KvBackend + ?Sized,
    B: WrappingKeyStore + ?Sized,
{
    pub fn new(domain_a: &'a A, domain_b: &'a B) -> Self {
        Self { domain_a, domain_b }
    }

    /// Return the current data key, minting a new epoch when there is none.
    ///
    /// With `allow_recovery_on_error` false, any corruption of either fragment
    /// is reported as `KeyReadFailure` and nothing is written.
    pub async fn get_or_create_data_key(
        &self,
        allow_recovery_on_error: bool,
    ) -> Result<ProvisionedKey, ProvisionError> {
        let mut store_reset = false;
        let mut state = ProvisionState::Fetching;

        loop {
            state = match state {
                ProvisionState::Fetching => match self.fetch().await {
                    Ok(Fetched::Key { data_key, wrapped }) => {
                        debug!("Unwrapped existing data key");
                        ProvisionState::Provisioned(ProvisionedKey {
                            data_key,
                            created: false,
                            epoch_id: hex::encode(wrapped),
                        })
                    }
                    Ok(Fetched::Empty) => ProvisionState::Generating,
                    Err(fault) => self.on_fault(fault, allow_recovery_on_error, store_reset)?,
                },
                ProvisionState::Generating => match self.generate().await {
                    Ok((data_key, epoch_id)) => {
                        debug!("Generated new key epoch");
                        ProvisionState::Provisioned(ProvisionedKey {
                            data_key,
                            created: true,
                            epoch_id,
                        })
                    }
                    Err(fault) => self.on_fault(fault, allow_recovery_on_error, store_reset)?,
                },
                ProvisionState::Corrupted(cause) => {
                    if !allow_recovery_on_error {
                        return Err(ProvisionError::KeyReadFailure { cause });
                    }
                    warn!(%cause, "Key fragments unusable, generating new epoch");
                    ProvisionState::Generating
                }
                ProvisionState::Recovering(cause) => {
                    warn!(%cause, "Key store broken, deleting it and retrying");
                    store_reset = true;
                    self.domain_b.delete().await.map_err(|e| {
                        error!(error = %e, "Key store deletion failed");
                        ProvisionError::UnrecoverableKeyStore {
                            cause: e.to_string(),
                        }
                    })?;
                    ProvisionState::Fetching
                }
                ProvisionState::Provisioned(key) => return Ok(key),
            };
        }
    }

    fn on_fault(
        &self,
        fault: Fault,
        allow_recovery_on_error: bool,
        store_reset: bool,
    ) -> Result<ProvisionState, ProvisionError> {
        match fault {
            Fault::Mismatch(cause) => Ok(ProvisionState::Corrupted(cause)),
            Fault::Other(cause) => Err(ProvisionError::KeyReadFailure { cause }),
            Fault::Structural(e) if !allow_recovery_on_error => {
                Err(ProvisionError::KeyReadFailure {
                    cause: e.to_string(),
                })
            }
            Fault::Structural(e) if store_reset => {
                error!(error = %e, "Key store still broken after deletion");
                Err(ProvisionError::UnrecoverableKeyStore {
                    cause: e.to_string(),
                })
            }
            Fault::Structural(e) => Ok(ProvisionState::Recovering(e)),
        }
    }

    async fn fetch(&self) -> Result<Fetched, Fault> {
        let wrapped_store = WrappedKeyStore::new(self.domain_a);
        let (wrapping_key, wrapped) = tokio::join!(self.domain_b.get(), wrapped_store.get());

        let wrapping_key = wrapping_key.map_err(Fault::Structural)?;
        let wrapped = wrapped.map_err(|e| Fault::Mismatch(format!("wrapped data key: {e}")))?;

        match (wrapping_key, wrapped) {
            (None, None) => Ok(Fetched::Empty),
            (Some(_), None) => {
                warn!("Wrapping key without wrapped blob, finishing interrupted mint");
                Ok(Fetched::Empty)
            }
            (None, Some(_)) => Err(Fault::Mismatch(
                "wrapped data key present but wrapping key absent".into(),
            )),
            (Some(wrapping_key), Some(wrapped)) => match unwrap_data_key(&wrapped, &wrapping_key) {
                Ok(data_key) => Ok(Fetched::Key { data_key, wrapped }),
                Err(e) => Err(Fault::Mismatch(e.to_string())),
            },
        }
    }

    /// Mint and persist a new epoch: wrapping key first, then the wrapped blob.
    async fn generate(&self) -> Result<(DataKey, String), Fault> {
        let epoch = generate_epoch().map_err(|e| Fault::Other(e.to_string()))?;
        self.domain_b
            .set(&epoch.wrapping_key)
            .await
            .map_err(Fault::Structural)?;
        WrappedKeyStore::new(self.domain_a)
            .set(&epoch.wrapped)
            .await
            .map_err(|e| Fault::Other(format!("writing wrapped data key: {e}")))?;
        Ok((epoch.data_key, hex::encode(epoch.wrapped)))
    }
}
