//! Request signing. Reads travel unsigned; writes are signed with the
//! submitter's key from the wallet.

use ledger_crypto::sign_request;
use ledger_types::{Did, Request, ValidationError};
use thiserror::Error;

use crate::wallet::{KeyStore, WalletError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error(transparent)]
    KeyUnavailable(#[from] WalletError),
    #[error("request submitter {request} does not match signing identity {signer}")]
    SubmitterMismatch { request: Did, signer: Did },
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Signs `request` as `submitter`. Pure apart from the wallet lookup.
pub fn sign<K: KeyStore + ?Sized>(
    request: &Request,
    wallet: &K,
    submitter: &Did,
) -> Result<Request, SignerError> {
    if request.identifier != *submitter {
        return Err(SignerError::SubmitterMismatch {
            request: request.identifier.clone(),
            signer: submitter.clone(),
        });
    }
    let key = wallet.signing_key(submitter)?;
    Ok(sign_request(request, &key)?)
}

/// Signs writes; returns reads unchanged without consulting the wallet.
pub fn sign_if_required<K: KeyStore + ?Sized>(
    request: &Request,
    wallet: &K,
    submitter: &Did,
) -> Result<Request, SignerError> {
    if request.kind().is_read() {
        return Ok(request.clone());
    }
    sign(request, wallet, submitter)
}
