//! Bucket layout and row codec for everything the address manager persists.
//!
//! All integers are little-endian. Variable-length tails are length-prefixed
//! with a u32. Decoding is strict: short rows, unknown type tags, and wrong
//! fixed-field widths all fail with a database error rather than decoding to
//! something plausible.
//!
//! Layout below the manager's namespace bucket:
//!
//! ```text
//! main/                 manager record (version, master keys, crypto keys)
//! sync/                 birthday
//! scope-schema/         {scope key -> schema (2 bytes)}
//! scope/
//!   <scope key (8 B)>/
//!     acct/             {account u32 -> account row}
//!     acctnameidx/      {name -> account u32}
//!     acctididx/        {account u32 -> name}
//!     addr/             {sha256(script addr) -> address row}
//!     addracctidx/      address -> account, plus nested per-account sets
//!     usedaddrs/        {sha256(script addr) -> 1 byte}
//!     meta/             {lastaccount -> u32}
//! ```

use keel_walletdb::Bucket;

use crate::{
    error::Error,
    scope::{AddressType, KeyScope, ScopeAddrSchema},
};

// Bucket names.
pub(crate) const MAIN_BUCKET: &[u8] = b"main";
pub(crate) const SYNC_BUCKET: &[u8] = b"sync";
pub(crate) const SCOPE_BUCKET: &[u8] = b"scope";
pub(crate) const SCOPE_SCHEMA_BUCKET: &[u8] = b"scope-schema";
pub(crate) const USED_ADDR_BUCKET: &[u8] = b"usedaddrs";
pub(crate) const ACCT_BUCKET: &[u8] = b"acct";
pub(crate) const ACCT_NAME_IDX_BUCKET: &[u8] = b"acctnameidx";
pub(crate) const ACCT_ID_IDX_BUCKET: &[u8] = b"acctididx";
pub(crate) const ADDR_BUCKET: &[u8] = b"addr";
pub(crate) const ADDR_ACCT_IDX_BUCKET: &[u8] = b"addracctidx";
pub(crate) const META_BUCKET: &[u8] = b"meta";

// Keys inside the main bucket.
pub(crate) const MGR_VERSION_KEY: &[u8] = b"mgrver";
pub(crate) const MGR_CREATE_DATE_KEY: &[u8] = b"mgrcreated";
pub(crate) const MASTER_HD_PRIV_KEY: &[u8] = b"mhdpriv";
pub(crate) const MASTER_HD_PUB_KEY: &[u8] = b"mhdpub";
pub(crate) const MASTER_PRIV_PARAMS_KEY: &[u8] = b"mpriv";
pub(crate) const MASTER_PUB_PARAMS_KEY: &[u8] = b"mpub";
pub(crate) const CRYPTO_PRIV_KEY: &[u8] = b"cpriv";
pub(crate) const CRYPTO_PUB_KEY: &[u8] = b"cpub";
pub(crate) const CRYPTO_SCRIPT_KEY: &[u8] = b"cscript";
pub(crate) const WATCHING_ONLY_KEY: &[u8] = b"watchonly";

// Keys inside scoped buckets.
pub(crate) const COIN_TYPE_PRIV_KEY: &[u8] = b"ctpriv";
pub(crate) const COIN_TYPE_PUB_KEY: &[u8] = b"ctpub";
pub(crate) const LAST_ACCOUNT_KEY: &[u8] = b"lastaccount";

// Keys inside the sync bucket.
pub(crate) const BIRTHDAY_KEY: &[u8] = b"birthday";

/// The manager version this software reads and writes. Opening a database
/// with any other version fails with [`Error::Upgrade`].
pub(crate) const LATEST_MGR_VERSION: u32 = 8;

// --- row types --- //

/// Persisted account state, tagged by the account type byte.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum AccountRow {
    Default(DefaultAccountRow),
    WatchOnly(WatchOnlyAccountRow),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct DefaultAccountRow {
    pub pub_key_encrypted: Vec<u8>,
    pub priv_key_encrypted: Vec<u8>,
    pub next_external_index: u32,
    pub next_internal_index: u32,
    pub name: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct WatchOnlyAccountRow {
    pub pub_key_encrypted: Vec<u8>,
    pub master_key_fingerprint: u32,
    pub next_external_index: u32,
    pub next_internal_index: u32,
    pub name: String,
    pub addr_schema: Option<ScopeAddrSchema>,
}

const ACCT_TYPE_DEFAULT: u8 = 0;
const ACCT_TYPE_WATCH_ONLY: u8 = 1;

/// Persisted address state: the envelope fields shared by every address
/// plus a payload selected by the type byte.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct AddressRow {
    pub account: u32,
    pub add_time: u64,
    pub sync_status: u8,
    pub data: AddressRowData,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum AddressRowData {
    /// An address derived from the account's branch keys; carries only its
    /// location, never key material.
    Chain { branch: u32, index: u32 },
    /// An imported key pair; both halves are ciphertexts.
    Imported {
        pub_key_encrypted: Vec<u8>,
        priv_key_encrypted: Vec<u8>,
    },
    /// An imported P2SH script; hash and script are ciphertexts.
    Script {
        hash_encrypted: Vec<u8>,
        script_encrypted: Vec<u8>,
    },
    /// An imported witness script (v0 = P2WSH, v1 = taproot script
    /// commitment); hash and script are ciphertexts.
    WitnessScript {
        witness_version: u8,
        is_secret_script: bool,
        hash_encrypted: Vec<u8>,
        script_encrypted: Vec<u8>,
    },
}

const ADDR_TYPE_CHAIN: u8 = 0;
const ADDR_TYPE_IMPORTED: u8 = 1;
const ADDR_TYPE_SCRIPT: u8 = 2;
const ADDR_TYPE_WITNESS_SCRIPT: u8 = 3;
const ADDR_TYPE_TAPROOT_SCRIPT: u8 = 4;

// --- codec helpers --- //

/// A strict little-endian reader over one row.
struct Reader<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.buf.len() < n {
            return Err(Error::malformed(self.what));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, Error> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64, Error> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8 bytes")))
    }

    /// A u32 length prefix followed by that many bytes.
    fn lp_bytes(&mut self) -> Result<&'a [u8], Error> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn lp_string(&mut self) -> Result<String, Error> {
        let bytes = self.lp_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::malformed(self.what))
    }

    fn finish(self) -> Result<(), Error> {
        if !self.buf.is_empty() {
            return Err(Error::malformed(self.what));
        }
        Ok(())
    }
}

fn put_lp_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

pub(crate) fn u32_to_bytes(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

/// A length-prefixed string, the account-name index key format.
pub(crate) fn string_to_bytes(value: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + value.len());
    put_lp_bytes(&mut buf, value.as_bytes());
    buf
}

pub(crate) const SCOPE_KEY_LEN: usize = 8;

pub(crate) fn scope_to_bytes(scope: &KeyScope) -> [u8; SCOPE_KEY_LEN] {
    let mut buf = [0u8; SCOPE_KEY_LEN];
    buf[0..4].copy_from_slice(&scope.purpose.to_le_bytes());
    buf[4..8].copy_from_slice(&scope.coin.to_le_bytes());
    buf
}

pub(crate) fn scope_from_bytes(bytes: &[u8]) -> Option<KeyScope> {
    if bytes.len() != SCOPE_KEY_LEN {
        return None;
    }
    Some(KeyScope {
        purpose: u32::from_le_bytes(bytes[0..4].try_into().expect("4 bytes")),
        coin: u32::from_le_bytes(bytes[4..8].try_into().expect("4 bytes")),
    })
}

pub(crate) fn scope_schema_to_bytes(schema: &ScopeAddrSchema) -> [u8; 2] {
    [
        schema.internal_addr_type as u8,
        schema.external_addr_type as u8,
    ]
}

pub(crate) fn scope_schema_from_bytes(
    bytes: &[u8],
) -> Result<ScopeAddrSchema, Error> {
    if bytes.len() != 2 {
        return Err(Error::malformed("scope schema"));
    }
    let internal = AddressType::from_u8(bytes[0])
        .ok_or_else(|| Error::malformed("scope schema"))?;
    let external = AddressType::from_u8(bytes[1])
        .ok_or_else(|| Error::malformed("scope schema"))?;
    Ok(ScopeAddrSchema {
        internal_addr_type: internal,
        external_addr_type: external,
    })
}

// --- account row codec --- //

pub(crate) fn serialize_account_row(row: &AccountRow) -> Vec<u8> {
    let (acct_type, raw) = match row {
        AccountRow::Default(row) => {
            (ACCT_TYPE_DEFAULT, serialize_default_account_raw(row))
        }
        AccountRow::WatchOnly(row) => {
            (ACCT_TYPE_WATCH_ONLY, serialize_watch_only_account_raw(row))
        }
    };

    let mut buf = Vec::with_capacity(5 + raw.len());
    buf.push(acct_type);
    put_lp_bytes(&mut buf, &raw);
    buf
}

fn serialize_default_account_raw(row: &DefaultAccountRow) -> Vec<u8> {
    let mut raw = Vec::with_capacity(
        20 + row.pub_key_encrypted.len()
            + row.priv_key_encrypted.len()
            + row.name.len(),
    );
    put_lp_bytes(&mut raw, &row.pub_key_encrypted);
    put_lp_bytes(&mut raw, &row.priv_key_encrypted);
    raw.extend_from_slice(&row.next_external_index.to_le_bytes());
    raw.extend_from_slice(&row.next_internal_index.to_le_bytes());
    put_lp_bytes(&mut raw, row.name.as_bytes());
    raw
}

fn serialize_watch_only_account_raw(row: &WatchOnlyAccountRow) -> Vec<u8> {
    let mut raw = Vec::with_capacity(
        21 + row.pub_key_encrypted.len() + row.name.len() + 2,
    );
    put_lp_bytes(&mut raw, &row.pub_key_encrypted);
    raw.extend_from_slice(&row.master_key_fingerprint.to_le_bytes());
    raw.extend_from_slice(&row.next_external_index.to_le_bytes());
    raw.extend_from_slice(&row.next_internal_index.to_le_bytes());
    put_lp_bytes(&mut raw, row.name.as_bytes());
    match &row.addr_schema {
        Some(schema) => {
            raw.push(1);
            raw.extend_from_slice(&scope_schema_to_bytes(schema));
        }
        None => raw.push(0),
    }
    raw
}

pub(crate) fn deserialize_account_row(
    serialized: &[u8],
) -> Result<AccountRow, Error> {
    let mut reader = Reader::new(serialized, "account row");
    let acct_type = reader.u8()?;
    let raw = reader.lp_bytes()?;
    reader.finish()?;

    match acct_type {
        ACCT_TYPE_DEFAULT => {
            Ok(AccountRow::Default(deserialize_default_account_raw(raw)?))
        }
        ACCT_TYPE_WATCH_ONLY => Ok(AccountRow::WatchOnly(
            deserialize_watch_only_account_raw(raw)?,
        )),
        _ => Err(Error::malformed("account row")),
    }
}

fn deserialize_default_account_raw(
    raw: &[u8],
) -> Result<DefaultAccountRow, Error> {
    let mut reader = Reader::new(raw, "default account row");
    let row = DefaultAccountRow {
        pub_key_encrypted: reader.lp_bytes()?.to_vec(),
        priv_key_encrypted: reader.lp_bytes()?.to_vec(),
        next_external_index: reader.u32()?,
        next_internal_index: reader.u32()?,
        name: reader.lp_string()?,
    };
    reader.finish()?;
    Ok(row)
}

fn deserialize_watch_only_account_raw(
    raw: &[u8],
) -> Result<WatchOnlyAccountRow, Error> {
    let mut reader = Reader::new(raw, "watch-only account row");
    let pub_key_encrypted = reader.lp_bytes()?.to_vec();
    let master_key_fingerprint = reader.u32()?;
    let next_external_index = reader.u32()?;
    let next_internal_index = reader.u32()?;
    let name = reader.lp_string()?;
    let addr_schema = match reader.u8()? {
        0 => None,
        1 => Some(scope_schema_from_bytes(reader.take(2)?)?),
        _ => return Err(Error::malformed("watch-only account row")),
    };
    reader.finish()?;
    Ok(WatchOnlyAccountRow {
        pub_key_encrypted,
        master_key_fingerprint,
        next_external_index,
        next_internal_index,
        name,
        addr_schema,
    })
}

impl AccountRow {
    pub(crate) fn name(&self) -> &str {
        match self {
            AccountRow::Default(row) => &row.name,
            AccountRow::WatchOnly(row) => &row.name,
        }
    }

    pub(crate) fn next_index(&self, internal: bool) -> u32 {
        match (self, internal) {
            (AccountRow::Default(row), false) => row.next_external_index,
            (AccountRow::Default(row), true) => row.next_internal_index,
            (AccountRow::WatchOnly(row), false) => row.next_external_index,
            (AccountRow::WatchOnly(row), true) => row.next_internal_index,
        }
    }

    pub(crate) fn set_next_index(&mut self, internal: bool, next: u32) {
        match (self, internal) {
            (AccountRow::Default(row), false) => {
                row.next_external_index = next
            }
            (AccountRow::Default(row), true) => row.next_internal_index = next,
            (AccountRow::WatchOnly(row), false) => {
                row.next_external_index = next
            }
            (AccountRow::WatchOnly(row), true) => {
                row.next_internal_index = next
            }
        }
    }
}

// --- address row codec --- //

pub(crate) fn serialize_address_row(row: &AddressRow) -> Vec<u8> {
    let (addr_type, raw) = match &row.data {
        AddressRowData::Chain { branch, index } => {
            // Fixed 8-byte payload.
            let mut raw = Vec::with_capacity(8);
            raw.extend_from_slice(&branch.to_le_bytes());
            raw.extend_from_slice(&index.to_le_bytes());
            (ADDR_TYPE_CHAIN, raw)
        }
        AddressRowData::Imported {
            pub_key_encrypted,
            priv_key_encrypted,
        } => {
            let mut raw = Vec::new();
            put_lp_bytes(&mut raw, pub_key_encrypted);
            put_lp_bytes(&mut raw, priv_key_encrypted);
            (ADDR_TYPE_IMPORTED, raw)
        }
        AddressRowData::Script {
            hash_encrypted,
            script_encrypted,
        } => {
            let mut raw = Vec::new();
            put_lp_bytes(&mut raw, hash_encrypted);
            put_lp_bytes(&mut raw, script_encrypted);
            (ADDR_TYPE_SCRIPT, raw)
        }
        AddressRowData::WitnessScript {
            witness_version,
            is_secret_script,
            hash_encrypted,
            script_encrypted,
        } => {
            let mut raw = Vec::new();
            raw.push(*witness_version);
            raw.push(u8::from(*is_secret_script));
            put_lp_bytes(&mut raw, hash_encrypted);
            put_lp_bytes(&mut raw, script_encrypted);
            let tag = if *witness_version == 1 {
                ADDR_TYPE_TAPROOT_SCRIPT
            } else {
                ADDR_TYPE_WITNESS_SCRIPT
            };
            (tag, raw)
        }
    };

    let mut buf = Vec::with_capacity(18 + raw.len());
    buf.push(addr_type);
    buf.extend_from_slice(&row.account.to_le_bytes());
    buf.extend_from_slice(&row.add_time.to_le_bytes());
    buf.push(row.sync_status);
    put_lp_bytes(&mut buf, &raw);
    buf
}

pub(crate) fn deserialize_address_row(
    serialized: &[u8],
) -> Result<AddressRow, Error> {
    let mut reader = Reader::new(serialized, "address row");
    let addr_type = reader.u8()?;
    let account = reader.u32()?;
    let add_time = reader.u64()?;
    let sync_status = reader.u8()?;
    let raw = reader.lp_bytes()?;
    reader.finish()?;

    let mut raw = Reader::new(raw, "address row payload");
    let data = match addr_type {
        ADDR_TYPE_CHAIN => AddressRowData::Chain {
            branch: raw.u32()?,
            index: raw.u32()?,
        },
        ADDR_TYPE_IMPORTED => AddressRowData::Imported {
            pub_key_encrypted: raw.lp_bytes()?.to_vec(),
            priv_key_encrypted: raw.lp_bytes()?.to_vec(),
        },
        ADDR_TYPE_SCRIPT => AddressRowData::Script {
            hash_encrypted: raw.lp_bytes()?.to_vec(),
            script_encrypted: raw.lp_bytes()?.to_vec(),
        },
        ADDR_TYPE_WITNESS_SCRIPT | ADDR_TYPE_TAPROOT_SCRIPT => {
            AddressRowData::WitnessScript {
                witness_version: raw.u8()?,
                is_secret_script: raw.u8()? != 0,
                hash_encrypted: raw.lp_bytes()?.to_vec(),
                script_encrypted: raw.lp_bytes()?.to_vec(),
            }
        }
        _ => return Err(Error::malformed("address row")),
    };
    raw.finish()?;

    Ok(AddressRow { account, add_time, sync_status, data })
}

// --- bucket accessors --- //

fn main_bucket<'a>(ns: &Bucket<'a>) -> Result<Bucket<'a>, Error> {
    ns.nested_bucket(MAIN_BUCKET)?
        .ok_or_else(|| Error::malformed("main bucket"))
}

fn sync_bucket<'a>(ns: &Bucket<'a>) -> Result<Bucket<'a>, Error> {
    ns.nested_bucket(SYNC_BUCKET)?
        .ok_or_else(|| Error::malformed("sync bucket"))
}

pub(crate) fn scope_bucket<'a>(
    ns: &Bucket<'a>,
    scope: &KeyScope,
) -> Result<Bucket<'a>, Error> {
    let root = ns
        .nested_bucket(SCOPE_BUCKET)?
        .ok_or_else(|| Error::malformed("scope bucket"))?;
    root.nested_bucket(&scope_to_bytes(scope))?
        .ok_or(Error::ScopeNotFound)
}

fn scoped_nested<'a>(
    ns: &Bucket<'a>,
    scope: &KeyScope,
    name: &'static [u8],
) -> Result<Bucket<'a>, Error> {
    scope_bucket(ns, scope)?
        .nested_bucket(name)?
        .ok_or_else(|| Error::malformed("scoped bucket"))
}

/// The manager record exists iff the main bucket exists.
pub(crate) fn manager_exists(ns: &Bucket<'_>) -> Result<bool, Error> {
    Ok(ns.nested_bucket(MAIN_BUCKET)?.is_some())
}

// --- namespace creation --- //

/// Create the manager's bucket skeleton plus one scoped subtree per entry
/// of `default_scopes`, then stamp the version and creation time.
pub(crate) fn create_manager_ns(
    ns: &Bucket<'_>,
    default_scopes: &[(KeyScope, ScopeAddrSchema)],
    created_at: u64,
) -> Result<(), Error> {
    let main = ns.create_bucket(MAIN_BUCKET)?;
    ns.create_bucket(SYNC_BUCKET)?;
    let scopes = ns.create_bucket(SCOPE_BUCKET)?;
    let schemas = ns.create_bucket(SCOPE_SCHEMA_BUCKET)?;

    for (scope, schema) in default_scopes {
        let scope_key = scope_to_bytes(scope);
        schemas.put(&scope_key, &scope_schema_to_bytes(schema))?;
        create_scoped_manager_ns(&scopes, scope)?;
        put_last_account(ns, scope, crate::scope::DEFAULT_ACCOUNT_NUM)?;
    }

    put_manager_version(ns, LATEST_MGR_VERSION)?;
    main.put(MGR_CREATE_DATE_KEY, &created_at.to_le_bytes())?;
    Ok(())
}

/// Create the bucket subtree for one scope below the scope root bucket.
pub(crate) fn create_scoped_manager_ns(
    scope_root: &Bucket<'_>,
    scope: &KeyScope,
) -> Result<(), Error> {
    let bucket = scope_root.create_bucket(&scope_to_bytes(scope))?;
    bucket.create_bucket(ACCT_BUCKET)?;
    bucket.create_bucket(ADDR_BUCKET)?;
    bucket.create_bucket(USED_ADDR_BUCKET)?;
    bucket.create_bucket(ADDR_ACCT_IDX_BUCKET)?;
    bucket.create_bucket(ACCT_NAME_IDX_BUCKET)?;
    bucket.create_bucket(ACCT_ID_IDX_BUCKET)?;
    bucket.create_bucket(META_BUCKET)?;
    Ok(())
}

// --- manager record --- //

pub(crate) fn fetch_manager_version(ns: &Bucket<'_>) -> Result<u32, Error> {
    let bytes = main_bucket(ns)?
        .get(MGR_VERSION_KEY)?
        .ok_or_else(|| Error::malformed("manager version"))?;
    let bytes: [u8; 4] =
        bytes.as_slice().try_into().map_err(|_| Error::malformed("manager version"))?;
    Ok(u32::from_le_bytes(bytes))
}

pub(crate) fn put_manager_version(
    ns: &Bucket<'_>,
    version: u32,
) -> Result<(), Error> {
    main_bucket(ns)?.put(MGR_VERSION_KEY, &u32_to_bytes(version))?;
    Ok(())
}

pub(crate) fn fetch_watching_only(ns: &Bucket<'_>) -> Result<bool, Error> {
    let flag = main_bucket(ns)?
        .get(WATCHING_ONLY_KEY)?
        .ok_or_else(|| Error::malformed("watching-only flag"))?;
    if flag.len() != 1 {
        return Err(Error::malformed("watching-only flag"));
    }
    Ok(flag[0] != 0)
}

pub(crate) fn put_watching_only(
    ns: &Bucket<'_>,
    watching_only: bool,
) -> Result<(), Error> {
    main_bucket(ns)?.put(WATCHING_ONLY_KEY, &[u8::from(watching_only)])?;
    Ok(())
}

/// Master key derivation parameters: the public side is mandatory, the
/// private side is absent on watching-only managers.
pub(crate) fn fetch_master_key_params(
    ns: &Bucket<'_>,
) -> Result<(Vec<u8>, Option<Vec<u8>>), Error> {
    let main = main_bucket(ns)?;
    let pub_params = main
        .get(MASTER_PUB_PARAMS_KEY)?
        .ok_or_else(|| Error::malformed("master public key parameters"))?;
    let priv_params = main.get(MASTER_PRIV_PARAMS_KEY)?;
    Ok((pub_params, priv_params))
}

pub(crate) fn put_master_key_params(
    ns: &Bucket<'_>,
    pub_params: Option<&[u8]>,
    priv_params: Option<&[u8]>,
) -> Result<(), Error> {
    let main = main_bucket(ns)?;
    if let Some(params) = priv_params {
        main.put(MASTER_PRIV_PARAMS_KEY, params)?;
    }
    if let Some(params) = pub_params {
        main.put(MASTER_PUB_PARAMS_KEY, params)?;
    }
    Ok(())
}

/// The sealed working keys: the public one is mandatory, the private and
/// script ones are absent on watching-only managers.
#[allow(clippy::type_complexity)]
pub(crate) fn fetch_crypto_keys(
    ns: &Bucket<'_>,
) -> Result<(Vec<u8>, Option<Vec<u8>>, Option<Vec<u8>>), Error> {
    let main = main_bucket(ns)?;
    let pub_enc = main
        .get(CRYPTO_PUB_KEY)?
        .ok_or_else(|| Error::malformed("encrypted crypto public key"))?;
    let priv_enc = main.get(CRYPTO_PRIV_KEY)?;
    let script_enc = main.get(CRYPTO_SCRIPT_KEY)?;
    Ok((pub_enc, priv_enc, script_enc))
}

pub(crate) fn put_crypto_keys(
    ns: &Bucket<'_>,
    pub_enc: Option<&[u8]>,
    priv_enc: Option<&[u8]>,
    script_enc: Option<&[u8]>,
) -> Result<(), Error> {
    let main = main_bucket(ns)?;
    if let Some(enc) = pub_enc {
        main.put(CRYPTO_PUB_KEY, enc)?;
    }
    if let Some(enc) = priv_enc {
        main.put(CRYPTO_PRIV_KEY, enc)?;
    }
    if let Some(enc) = script_enc {
        main.put(CRYPTO_SCRIPT_KEY, enc)?;
    }
    Ok(())
}

pub(crate) fn put_master_hd_keys(
    ns: &Bucket<'_>,
    master_hd_priv_enc: Option<&[u8]>,
    master_hd_pub_enc: Option<&[u8]>,
) -> Result<(), Error> {
    let main = main_bucket(ns)?;
    if let Some(enc) = master_hd_priv_enc {
        main.put(MASTER_HD_PRIV_KEY, enc)?;
    }
    if let Some(enc) = master_hd_pub_enc {
        main.put(MASTER_HD_PUB_KEY, enc)?;
    }
    Ok(())
}

pub(crate) fn fetch_master_hd_keys(
    ns: &Bucket<'_>,
) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>), Error> {
    let main = main_bucket(ns)?;
    Ok((main.get(MASTER_HD_PRIV_KEY)?, main.get(MASTER_HD_PUB_KEY)?))
}

/// Birthday is stored little-endian, the same as every other timestamp.
pub(crate) fn fetch_birthday(ns: &Bucket<'_>) -> Result<u64, Error> {
    let bytes = sync_bucket(ns)?
        .get(BIRTHDAY_KEY)?
        .ok_or_else(|| Error::malformed("birthday"))?;
    let bytes: [u8; 8] =
        bytes.as_slice().try_into().map_err(|_| Error::malformed("birthday"))?;
    Ok(u64::from_le_bytes(bytes))
}

pub(crate) fn put_birthday(
    ns: &Bucket<'_>,
    birthday: u64,
) -> Result<(), Error> {
    sync_bucket(ns)?.put(BIRTHDAY_KEY, &birthday.to_le_bytes())?;
    Ok(())
}

// --- scopes --- //

pub(crate) fn fetch_scope_addr_schema(
    ns: &Bucket<'_>,
    scope: &KeyScope,
) -> Result<ScopeAddrSchema, Error> {
    let schemas = ns
        .nested_bucket(SCOPE_SCHEMA_BUCKET)?
        .ok_or(Error::ScopeNotFound)?;
    let bytes = schemas
        .get(&scope_to_bytes(scope))?
        .ok_or(Error::ScopeNotFound)?;
    scope_schema_from_bytes(&bytes)
}

pub(crate) fn put_scope_addr_schema(
    ns: &Bucket<'_>,
    scope: &KeyScope,
    schema: &ScopeAddrSchema,
) -> Result<(), Error> {
    let schemas = ns
        .nested_bucket(SCOPE_SCHEMA_BUCKET)?
        .ok_or_else(|| Error::malformed("scope schema bucket"))?;
    schemas.put(&scope_to_bytes(scope), &scope_schema_to_bytes(schema))?;
    Ok(())
}

pub(crate) fn for_each_key_scope<F>(
    ns: &Bucket<'_>,
    mut f: F,
) -> Result<(), Error>
where
    F: FnMut(KeyScope) -> Result<(), Error>,
{
    let scopes = ns
        .nested_bucket(SCOPE_BUCKET)?
        .ok_or_else(|| Error::malformed("scope bucket"))?;
    scopes.for_each(|key, _value| match scope_from_bytes(key) {
        Some(scope) => f(scope),
        None => Ok(()),
    })
}

/// Sealed coin-type keys for one scope. Either may be absent: the private
/// one on watching-only managers, both on watching-only scopes.
pub(crate) fn fetch_coin_type_keys(
    ns: &Bucket<'_>,
    scope: &KeyScope,
) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>), Error> {
    let bucket = scope_bucket(ns, scope)?;
    Ok((bucket.get(COIN_TYPE_PUB_KEY)?, bucket.get(COIN_TYPE_PRIV_KEY)?))
}

pub(crate) fn put_coin_type_keys(
    ns: &Bucket<'_>,
    scope: &KeyScope,
    coin_type_pub_enc: Option<&[u8]>,
    coin_type_priv_enc: Option<&[u8]>,
) -> Result<(), Error> {
    let bucket = scope_bucket(ns, scope)?;
    if let Some(enc) = coin_type_pub_enc {
        bucket.put(COIN_TYPE_PUB_KEY, enc)?;
    }
    if let Some(enc) = coin_type_priv_enc {
        bucket.put(COIN_TYPE_PRIV_KEY, enc)?;
    }
    Ok(())
}

// --- accounts --- //

pub(crate) fn put_account_row(
    ns: &Bucket<'_>,
    scope: &KeyScope,
    account: u32,
    row: &AccountRow,
) -> Result<(), Error> {
    let bucket = scoped_nested(ns, scope, ACCT_BUCKET)?;
    bucket.put(&u32_to_bytes(account), &serialize_account_row(row))?;
    Ok(())
}

/// Store an account row together with both of its index entries.
pub(crate) fn put_account_info(
    ns: &Bucket<'_>,
    scope: &KeyScope,
    account: u32,
    row: &AccountRow,
) -> Result<(), Error> {
    put_account_row(ns, scope, account, row)?;

    let id_idx = scoped_nested(ns, scope, ACCT_ID_IDX_BUCKET)?;
    id_idx.put(&u32_to_bytes(account), &string_to_bytes(row.name()))?;

    let name_idx = scoped_nested(ns, scope, ACCT_NAME_IDX_BUCKET)?;
    name_idx.put(&string_to_bytes(row.name()), &u32_to_bytes(account))?;
    Ok(())
}

pub(crate) fn fetch_account_row(
    ns: &Bucket<'_>,
    scope: &KeyScope,
    account: u32,
) -> Result<AccountRow, Error> {
    let bucket = scoped_nested(ns, scope, ACCT_BUCKET)?;
    let serialized = bucket
        .get(&u32_to_bytes(account))?
        .ok_or(Error::AccountNotFound)?;
    deserialize_account_row(&serialized)
}

/// Look up an account number by name, `None` if the name is unused.
pub(crate) fn lookup_account_by_name(
    ns: &Bucket<'_>,
    scope: &KeyScope,
    name: &str,
) -> Result<Option<u32>, Error> {
    let idx = scoped_nested(ns, scope, ACCT_NAME_IDX_BUCKET)?;
    let value = idx.get(&string_to_bytes(name))?;
    value
        .map(|bytes| {
            let bytes: [u8; 4] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::malformed("account name index"))?;
            Ok(u32::from_le_bytes(bytes))
        })
        .transpose()
}

pub(crate) fn fetch_account_by_name(
    ns: &Bucket<'_>,
    scope: &KeyScope,
    name: &str,
) -> Result<u32, Error> {
    lookup_account_by_name(ns, scope, name)?.ok_or(Error::AccountNotFound)
}

pub(crate) fn fetch_account_name(
    ns: &Bucket<'_>,
    scope: &KeyScope,
    account: u32,
) -> Result<String, Error> {
    let idx = scoped_nested(ns, scope, ACCT_ID_IDX_BUCKET)?;
    let bytes = idx
        .get(&u32_to_bytes(account))?
        .ok_or(Error::AccountNotFound)?;
    let mut reader = Reader::new(&bytes, "account id index");
    let name = reader.lp_string()?;
    reader.finish()?;
    Ok(name)
}

pub(crate) fn fetch_last_account(
    ns: &Bucket<'_>,
    scope: &KeyScope,
) -> Result<u32, Error> {
    let meta = scoped_nested(ns, scope, META_BUCKET)?;
    let bytes = meta
        .get(LAST_ACCOUNT_KEY)?
        .ok_or_else(|| Error::malformed("last account"))?;
    let bytes: [u8; 4] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::malformed("last account"))?;
    Ok(u32::from_le_bytes(bytes))
}

pub(crate) fn put_last_account(
    ns: &Bucket<'_>,
    scope: &KeyScope,
    account: u32,
) -> Result<(), Error> {
    let meta = scoped_nested(ns, scope, META_BUCKET)?;
    meta.put(LAST_ACCOUNT_KEY, &u32_to_bytes(account))?;
    Ok(())
}

/// Visit every account number in the scope, in numeric order.
pub(crate) fn for_each_account<F>(
    ns: &Bucket<'_>,
    scope: &KeyScope,
    mut f: F,
) -> Result<(), Error>
where
    F: FnMut(u32) -> Result<(), Error>,
{
    let bucket = scoped_nested(ns, scope, ACCT_BUCKET)?;
    // Account keys are little-endian, so byte order is not numeric order;
    // collect and sort before visiting.
    let mut accounts = Vec::new();
    bucket.for_each(|key, value| -> Result<(), Error> {
        if value.is_none() {
            return Ok(());
        }
        let key: [u8; 4] = key
            .try_into()
            .map_err(|_| Error::malformed("account key"))?;
        accounts.push(u32::from_le_bytes(key));
        Ok(())
    })?;
    accounts.sort_unstable();
    for account in accounts {
        f(account)?;
    }
    Ok(())
}

// --- addresses --- //

/// Store an address row plus its two account-index entries, in that order.
pub(crate) fn put_address(
    ns: &Bucket<'_>,
    scope: &KeyScope,
    addr_key: &[u8; 32],
    row: &AddressRow,
) -> Result<(), Error> {
    let bucket = scoped_nested(ns, scope, ADDR_BUCKET)?;
    bucket.put(addr_key, &serialize_address_row(row))?;

    let idx = scoped_nested(ns, scope, ADDR_ACCT_IDX_BUCKET)?;
    idx.put(addr_key, &u32_to_bytes(row.account))?;
    let acct_set = idx.create_bucket_if_not_exists(&u32_to_bytes(row.account))?;
    acct_set.put(addr_key, &[])?;
    Ok(())
}

/// Store a chain-derived address and advance the account row's next-index
/// counter for its branch past `index`.
pub(crate) fn put_chained_address(
    ns: &Bucket<'_>,
    scope: &KeyScope,
    addr_key: &[u8; 32],
    account: u32,
    branch: u32,
    index: u32,
    add_time: u64,
) -> Result<(), Error> {
    let row = AddressRow {
        account,
        add_time,
        sync_status: 0,
        data: AddressRowData::Chain { branch, index },
    };
    put_address(ns, scope, addr_key, &row)?;

    let internal = branch == crate::scope::INTERNAL_BRANCH;
    let mut acct_row = fetch_account_row(ns, scope, account)?;
    let next = index + 1;
    if next > acct_row.next_index(internal) {
        acct_row.set_next_index(internal, next);
        put_account_row(ns, scope, account, &acct_row)?;
    }
    Ok(())
}

pub(crate) fn fetch_address(
    ns: &Bucket<'_>,
    scope: &KeyScope,
    addr_key: &[u8; 32],
) -> Result<AddressRow, Error> {
    let bucket = scoped_nested(ns, scope, ADDR_BUCKET)?;
    let serialized = bucket.get(addr_key)?.ok_or(Error::AddressNotFound)?;
    deserialize_address_row(&serialized)
}

/// Visit every address row in the scope.
pub(crate) fn for_each_address<F>(
    ns: &Bucket<'_>,
    scope: &KeyScope,
    mut f: F,
) -> Result<(), Error>
where
    F: FnMut(&[u8], AddressRow) -> Result<(), Error>,
{
    let bucket = scoped_nested(ns, scope, ADDR_BUCKET)?;
    bucket.for_each(|key, value| match value {
        Some(serialized) => f(key, deserialize_address_row(serialized)?),
        None => Ok(()),
    })
}

// --- used addresses --- //

pub(crate) fn put_used_addr_hash(
    ns: &Bucket<'_>,
    scope: &KeyScope,
    addr_key: &[u8; 32],
) -> Result<(), Error> {
    let bucket = scoped_nested(ns, scope, USED_ADDR_BUCKET)?;
    bucket.put(addr_key, &[1])?;
    Ok(())
}

pub(crate) fn fetch_used(
    ns: &Bucket<'_>,
    scope: &KeyScope,
    addr_key: &[u8; 32],
) -> Result<bool, Error> {
    let bucket = scoped_nested(ns, scope, USED_ADDR_BUCKET)?;
    Ok(bucket.get(addr_key)?.is_some())
}

#[cfg(test)]
mod test {
    use proptest::{arbitrary::any, collection::vec, proptest};

    use super::*;

    fn arb_bytes() -> impl proptest::strategy::Strategy<Value = Vec<u8>> {
        vec(any::<u8>(), 0..=64)
    }

    #[test]
    fn scope_key_roundtrip_and_layout() {
        let scope = KeyScope { purpose: 84, coin: 0 };
        let bytes = scope_to_bytes(&scope);
        assert_eq!(bytes, [84, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(scope_from_bytes(&bytes), Some(scope));
        assert_eq!(scope_from_bytes(&bytes[..7]), None);
    }

    #[test]
    fn scope_schema_roundtrip() {
        let schema = ScopeAddrSchema {
            external_addr_type: AddressType::NestedWitnessPubKey,
            internal_addr_type: AddressType::WitnessPubKey,
        };
        let bytes = scope_schema_to_bytes(&schema);
        // internal first, external second
        assert_eq!(bytes, [4, 3]);
        assert_eq!(scope_schema_from_bytes(&bytes).unwrap(), schema);
        assert!(scope_schema_from_bytes(&[4]).is_err());
        assert!(scope_schema_from_bytes(&[4, 255]).is_err());
    }

    #[test]
    fn default_account_row_roundtrip() {
        proptest!(|(
            pub_enc in arb_bytes(),
            priv_enc in arb_bytes(),
            next_ext in any::<u32>(),
            next_int in any::<u32>(),
            name in "[a-z0-9 ]{0,24}",
        )| {
            let row = AccountRow::Default(DefaultAccountRow {
                pub_key_encrypted: pub_enc,
                priv_key_encrypted: priv_enc,
                next_external_index: next_ext,
                next_internal_index: next_int,
                name,
            });
            let serialized = serialize_account_row(&row);
            let decoded = deserialize_account_row(&serialized).unwrap();
            assert_eq!(decoded, row);
        });
    }

    #[test]
    fn watch_only_account_row_roundtrip() {
        let schema = ScopeAddrSchema {
            external_addr_type: AddressType::TaprootPubKey,
            internal_addr_type: AddressType::TaprootPubKey,
        };
        for addr_schema in [None, Some(schema)] {
            let row = AccountRow::WatchOnly(WatchOnlyAccountRow {
                pub_key_encrypted: vec![7; 40],
                master_key_fingerprint: 0xdead_beef,
                next_external_index: 12,
                next_internal_index: 3,
                name: "cold storage".to_owned(),
                addr_schema,
            });
            let serialized = serialize_account_row(&row);
            let decoded = deserialize_account_row(&serialized).unwrap();
            assert_eq!(decoded, row);
        }
    }

    #[test]
    fn default_account_row_golden_layout() {
        let row = AccountRow::Default(DefaultAccountRow {
            pub_key_encrypted: vec![0xaa, 0xbb],
            priv_key_encrypted: vec![0xcc],
            next_external_index: 1,
            next_internal_index: 2,
            name: "ab".to_owned(),
        });
        let serialized = serialize_account_row(&row);
        let expected = [
            0x00, // account type: default
            0x19, 0x00, 0x00, 0x00, // raw len = 25
            0x02, 0x00, 0x00, 0x00, 0xaa, 0xbb, // pub
            0x01, 0x00, 0x00, 0x00, 0xcc, // priv
            0x01, 0x00, 0x00, 0x00, // next external
            0x02, 0x00, 0x00, 0x00, // next internal
            0x02, 0x00, 0x00, 0x00, b'a', b'b', // name
        ];
        assert_eq!(serialized, expected);
    }

    #[test]
    fn account_row_rejects_unknown_type_and_truncation() {
        let row = AccountRow::Default(DefaultAccountRow {
            pub_key_encrypted: vec![1],
            priv_key_encrypted: vec![2],
            next_external_index: 0,
            next_internal_index: 0,
            name: "x".to_owned(),
        });
        let mut serialized = serialize_account_row(&row);

        let mut bad_type = serialized.clone();
        bad_type[0] = 9;
        assert!(deserialize_account_row(&bad_type).is_err());

        serialized.truncate(serialized.len() - 1);
        assert!(deserialize_account_row(&serialized).is_err());
        assert!(deserialize_account_row(&[]).is_err());
    }

    #[test]
    fn chained_address_row_roundtrip_and_layout() {
        let row = AddressRow {
            account: 5,
            add_time: 0x0102_0304_0506_0708,
            sync_status: 0,
            data: AddressRowData::Chain { branch: 1, index: 42 },
        };
        let serialized = serialize_address_row(&row);
        let expected = [
            0x00, // address type: chain
            0x05, 0x00, 0x00, 0x00, // account
            0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, // add time
            0x00, // sync status
            0x08, 0x00, 0x00, 0x00, // raw len = 8
            0x01, 0x00, 0x00, 0x00, // branch
            0x2a, 0x00, 0x00, 0x00, // index
        ];
        assert_eq!(serialized, expected);
        assert_eq!(deserialize_address_row(&serialized).unwrap(), row);
    }

    #[test]
    fn address_row_roundtrip_all_kinds() {
        let kinds = [
            AddressRowData::Imported {
                pub_key_encrypted: vec![1; 73],
                priv_key_encrypted: vec![2; 72],
            },
            AddressRowData::Script {
                hash_encrypted: vec![3; 60],
                script_encrypted: vec![4; 90],
            },
            AddressRowData::WitnessScript {
                witness_version: 0,
                is_secret_script: true,
                hash_encrypted: vec![5; 72],
                script_encrypted: vec![6; 80],
            },
            AddressRowData::WitnessScript {
                witness_version: 1,
                is_secret_script: false,
                hash_encrypted: vec![7; 72],
                script_encrypted: vec![8; 80],
            },
        ];
        for data in kinds {
            let row = AddressRow {
                account: crate::scope::IMPORTED_ADDR_ACCOUNT,
                add_time: 1_700_000_000,
                sync_status: 0,
                data,
            };
            let serialized = serialize_address_row(&row);
            assert_eq!(deserialize_address_row(&serialized).unwrap(), row);
        }
    }

    #[test]
    fn address_row_rejects_unknown_type_and_truncation() {
        let row = AddressRow {
            account: 0,
            add_time: 0,
            sync_status: 0,
            data: AddressRowData::Chain { branch: 0, index: 0 },
        };
        let mut serialized = serialize_address_row(&row);

        let mut bad_type = serialized.clone();
        bad_type[0] = 200;
        assert!(deserialize_address_row(&bad_type).is_err());

        serialized.truncate(serialized.len() - 1);
        assert!(deserialize_address_row(&serialized).is_err());
    }

    #[test]
    fn taproot_script_rows_tag_by_witness_version() {
        let row = AddressRow {
            account: 0,
            add_time: 0,
            sync_status: 0,
            data: AddressRowData::WitnessScript {
                witness_version: 1,
                is_secret_script: true,
                hash_encrypted: vec![1],
                script_encrypted: vec![2],
            },
        };
        let serialized = serialize_address_row(&row);
        assert_eq!(serialized[0], ADDR_TYPE_TAPROOT_SCRIPT);

        let row = AddressRow {
            data: AddressRowData::WitnessScript {
                witness_version: 0,
                is_secret_script: true,
                hash_encrypted: vec![1],
                script_encrypted: vec![2],
            },
            ..row
        };
        let serialized = serialize_address_row(&row);
        assert_eq!(serialized[0], ADDR_TYPE_WITNESS_SCRIPT);
    }

    #[test]
    fn string_to_bytes_length_prefixes() {
        assert_eq!(string_to_bytes(""), vec![0, 0, 0, 0]);
        assert_eq!(
            string_to_bytes("abc"),
            vec![3, 0, 0, 0, b'a', b'b', b'c'],
        );
    }
}
