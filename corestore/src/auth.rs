//! Auth resolution - translate a `get` request into a core identity
//!
//! First match wins: `name`, `key_pair`, `manifest`, `key`,
//! `discovery_key`. A name or manifest may not be combined with a
//! caller-supplied secret key.

use crate::error::StoreError;
use crate::keys;
use crate::session::GetOptions;
use corestore_model::{CoreAuth, CoreEngine, Manifest, Namespace};
use std::sync::Arc;

pub(crate) struct AuthContext<'a> {
    pub primary_key: &'a [u8; 32],
    pub namespace: &'a Namespace,
    pub manifest_version: u32,
    pub engine: &'a Arc<dyn CoreEngine>,
}

/// Reject identity combinations that cannot be honored.
pub(crate) fn validate(opts: &GetOptions) -> Result<(), StoreError> {
    let has_secret = opts
        .key_pair
        .as_ref()
        .map(|kp| kp.secret_key.is_some())
        .unwrap_or(false);
    if has_secret && (opts.name.is_some() || opts.manifest.is_some()) {
        return Err(StoreError::InvalidInput(
            "a name or manifest cannot be combined with a secret key".to_string(),
        ));
    }
    let has_identity = opts.name.is_some()
        || opts.key.is_some()
        || opts.key_pair.is_some()
        || opts.manifest.is_some()
        || opts.discovery_key.is_some()
        || opts.preload.is_some();
    if !has_identity {
        return Err(StoreError::MissingIdentity);
    }
    Ok(())
}

pub(crate) fn resolve(ctx: &AuthContext<'_>, opts: &GetOptions) -> Result<CoreAuth, StoreError> {
    validate(opts)?;

    if let Some(name) = &opts.name {
        let key_pair = keys::create_key_pair(ctx.primary_key, ctx.namespace, name.as_bytes());
        let manifest = Manifest::single_signer(ctx.manifest_version, key_pair.public_key);
        let key = ctx.engine.key(&manifest);
        return Ok(CoreAuth {
            key: Some(key),
            discovery_key: ctx.engine.discovery_key(&key),
            manifest: Some(manifest),
            key_pair: Some(key_pair),
        });
    }

    if let Some(key_pair) = &opts.key_pair {
        let manifest = Manifest::single_signer(ctx.manifest_version, key_pair.public_key);
        let key = ctx.engine.key(&manifest);
        return Ok(CoreAuth {
            key: Some(key),
            discovery_key: ctx.engine.discovery_key(&key),
            manifest: Some(manifest),
            key_pair: Some(key_pair.clone()),
        });
    }

    if let Some(manifest) = &opts.manifest {
        let key = ctx.engine.key(manifest);
        return Ok(CoreAuth {
            key: Some(key),
            discovery_key: ctx.engine.discovery_key(&key),
            manifest: Some(manifest.clone()),
            key_pair: None,
        });
    }

    if let Some(key) = opts.key {
        // Read-only: the manifest is unknown until the engine loads it.
        return Ok(CoreAuth {
            key: Some(key),
            discovery_key: ctx.engine.discovery_key(&key),
            manifest: None,
            key_pair: None,
        });
    }

    if let Some(discovery_key) = opts.discovery_key {
        // Remote-only open; key and manifest unknown.
        return Ok(CoreAuth {
            key: None,
            discovery_key,
            manifest: None,
            key_pair: None,
        });
    }

    Err(StoreError::MissingIdentity)
}
