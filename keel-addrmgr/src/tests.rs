//! End-to-end tests of the manager lifecycle against a real database file.

use std::{str::FromStr, sync::Arc, time::SystemTime};

use bitcoin::{
    bip32::{DerivationPath as Bip32Path, Xpriv},
    key::CompressedPublicKey,
    secp256k1::Secp256k1,
    Address, Network,
};
use keel_crypto::{rng::WeakRng, ScryptOptions};
use keel_walletdb::{update, view, Db, DbOptions};

use crate::{
    error::Error,
    kv,
    manager::{root_key_from_seed, Manager},
    scope::{
        AddressType, DerivationPath, DEFAULT_ACCOUNT_NUM,
        HARDENED_KEY_START, KEY_SCOPE_BIP0084,
    },
    scoped::ScopedKeyManager,
    ManagedAddress,
};

const NS: &[u8] = b"waddrmgr";

const SEED: [u8; 32] = [
    0x2a, 0x64, 0xdf, 0x08, 0x5e, 0xab, 0xed, 0x58, 0x55, 0x0d, 0x11, 0x38,
    0x27, 0x9b, 0x4c, 0xa2, 0xf6, 0x50, 0xcc, 0x31, 0x9f, 0x1e, 0x81, 0xb3,
    0x9e, 0x0c, 0x5f, 0x0d, 0x13, 0x99, 0xc0, 0x64,
];

const PUB_PASS: &[u8] = b"_DJr{fL4H0O}*-0\n:V1izc)(6BomK";
const PRIV_PASS: &[u8] = b"81lUHXnOMZ@?XXd7O9xyDIWIbXX-lj";

struct Harness {
    _dir: tempfile::TempDir,
    db: Db,
    rng: WeakRng,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db =
            Db::create(dir.path().join("wallet.db"), DbOptions::default())
                .unwrap();
        Self { _dir: dir, db, rng: WeakRng::from_u64(20260801) }
    }

    fn create_wallet(&mut self) {
        let rng = &mut self.rng;
        update::<_, Error, _>(&self.db, |tx| {
            let ns = tx.create_top_level_bucket(NS)?;
            let root = root_key_from_seed(&SEED, Network::Bitcoin)?;
            Manager::create(
                &ns,
                rng,
                Some(&root),
                PUB_PASS,
                PRIV_PASS,
                Network::Bitcoin,
                &ScryptOptions::FAST,
                SystemTime::now(),
            )
        })
        .unwrap();
    }

    fn open(&mut self, pub_pass: &[u8]) -> Result<Manager, Error> {
        let rng = &mut self.rng;
        view::<_, Error, _>(&self.db, |tx| {
            let ns = tx.read_bucket(NS)?.ok_or(Error::NoExist)?;
            Manager::open(&ns, rng, pub_pass, Network::Bitcoin)
        })
    }

    fn unlock(&mut self, manager: &Manager) -> Result<(), Error> {
        let rng = &mut self.rng;
        update::<_, Error, _>(&self.db, |tx| {
            let ns = tx.read_write_bucket(NS)?.ok_or(Error::NoExist)?;
            manager.unlock(&ns, rng, PRIV_PASS)
        })
    }

    fn next_external(
        &mut self,
        smgr: &Arc<ScopedKeyManager>,
        account: u32,
        number: u32,
    ) -> Vec<Arc<ManagedAddress>> {
        let rng = &mut self.rng;
        update::<_, Error, _>(&self.db, |tx| {
            let ns = tx.read_write_bucket(NS)?.ok_or(Error::NoExist)?;
            smgr.next_external_addresses(&ns, rng, account, number)
        })
        .unwrap()
    }
}

fn unlocked_wallet() -> (Harness, Manager) {
    let mut harness = Harness::new();
    harness.create_wallet();
    let manager = harness.open(PUB_PASS).unwrap();
    harness.unlock(&manager).unwrap();
    (harness, manager)
}

/// The BIP-84 address an independent derivation produces for
/// m/84'/0'/0'/0/<index> on the test seed.
fn independent_bip84_address(index: u32) -> Address {
    let secp = Secp256k1::new();
    let root = Xpriv::new_master(Network::Bitcoin, &SEED).unwrap();
    let path =
        Bip32Path::from_str(&format!("84'/0'/0'/0/{index}")).unwrap();
    let child = root.derive_priv(&secp, &path).unwrap();
    let pubkey = CompressedPublicKey(
        child.private_key.public_key(&secp),
    );
    Address::p2wpkh(&pubkey, Network::Bitcoin)
}

// --- scenarios --- //

#[test]
fn create_and_reopen() {
    let mut harness = Harness::new();
    harness.create_wallet();

    // A second create must observe the first.
    let err = {
        let rng = &mut harness.rng;
        update::<_, Error, _>(&harness.db, |tx| {
            let ns = tx.read_write_bucket(NS)?.ok_or(Error::NoExist)?;
            let root = root_key_from_seed(&SEED, Network::Bitcoin)?;
            Manager::create(
                &ns,
                rng,
                Some(&root),
                PUB_PASS,
                PRIV_PASS,
                Network::Bitcoin,
                &ScryptOptions::FAST,
                SystemTime::now(),
            )
        })
        .unwrap_err()
    };
    assert!(matches!(err, Error::AlreadyExists));

    let manager = harness.open(PUB_PASS).unwrap();
    assert!(manager.is_locked());
    assert!(!manager.watch_only());

    assert!(matches!(
        harness.open(b"wrong"),
        Err(Error::WrongPassphrase),
    ));
}

#[test]
fn unlock_and_derive_first_external_bip84() {
    let (mut harness, manager) = unlocked_wallet();
    assert!(!manager.is_locked());

    let smgr = manager.scoped_key_manager(&KEY_SCOPE_BIP0084).unwrap();
    let addrs = harness.next_external(&smgr, DEFAULT_ACCOUNT_NUM, 1);
    assert_eq!(addrs.len(), 1);

    let expected = independent_bip84_address(0);
    assert_eq!(addrs[0].address().to_string(), expected.to_string());
    assert_eq!(addrs[0].addr_type(), AddressType::WitnessPubKey);
}

#[test]
fn raw_account_and_key_path_derivations_agree() {
    let (mut harness, manager) = unlocked_wallet();
    let smgr = manager.scoped_key_manager(&KEY_SCOPE_BIP0084).unwrap();

    {
        let rng = &mut harness.rng;
        update::<_, Error, _>(&harness.db, |tx| {
            let ns = tx.read_write_bucket(NS)?.ok_or(Error::NoExist)?;
            smgr.new_raw_account(&ns, rng, 1000)
        })
        .unwrap();
    }

    let chained = harness.next_external(&smgr, 1000, 1);
    let derived = {
        let rng = &mut harness.rng;
        let path = DerivationPath {
            internal_account: 1000,
            account: 1000 + HARDENED_KEY_START,
            branch: 0,
            index: 0,
        };
        update::<_, Error, _>(&harness.db, |tx| {
            let ns = tx.read_write_bucket(NS)?.ok_or(Error::NoExist)?;
            smgr.derive_from_key_path(&ns, rng, path)
        })
        .unwrap()
    };

    assert_eq!(chained[0].addr_type(), derived.addr_type());
    assert_eq!(chained[0].script_address(), derived.script_address());
    assert_eq!(
        chained[0].address().to_string(),
        derived.address().to_string(),
    );
}

#[test]
fn last_external_address_tracks_derivation() {
    let (mut harness, manager) = unlocked_wallet();
    let smgr = manager.scoped_key_manager(&KEY_SCOPE_BIP0084).unwrap();

    // Nothing derived yet.
    {
        let rng = &mut harness.rng;
        let err = update::<_, Error, _>(&harness.db, |tx| {
            let ns = tx.read_write_bucket(NS)?.ok_or(Error::NoExist)?;
            smgr.last_external_address(&ns, rng, DEFAULT_ACCOUNT_NUM)
        })
        .unwrap_err();
        assert!(matches!(err, Error::AddressNotFound));
    }

    let addrs = harness.next_external(&smgr, DEFAULT_ACCOUNT_NUM, 2);
    let last = {
        let rng = &mut harness.rng;
        update::<_, Error, _>(&harness.db, |tx| {
            let ns = tx.read_write_bucket(NS)?.ok_or(Error::NoExist)?;
            smgr.last_external_address(&ns, rng, DEFAULT_ACCOUNT_NUM)
        })
        .unwrap()
    };
    assert_eq!(last.address().to_string(), addrs[1].address().to_string());

    // Both halves of the path are recorded: the account the address is
    // associated with, and the hardened index it was derived with.
    let path = last.as_pub_key_addr().unwrap().derivation_path().unwrap().1;
    assert_eq!(path.internal_account, DEFAULT_ACCOUNT_NUM);
    assert_eq!(path.account, DEFAULT_ACCOUNT_NUM + HARDENED_KEY_START);
    assert_eq!(path.index, 1);

    // A fresh session has no cached last address and re-derives it.
    manager.close();
    let manager = harness.open(PUB_PASS).unwrap();
    harness.unlock(&manager).unwrap();
    let smgr = manager.scoped_key_manager(&KEY_SCOPE_BIP0084).unwrap();
    let rng = &mut harness.rng;
    let rederived = update::<_, Error, _>(&harness.db, |tx| {
        let ns = tx.read_write_bucket(NS)?.ok_or(Error::NoExist)?;
        smgr.last_external_address(&ns, rng, DEFAULT_ACCOUNT_NUM)
    })
    .unwrap();
    assert_eq!(
        rederived.address().to_string(),
        independent_bip84_address(1).to_string(),
    );
}

#[test]
fn duplicate_account_name_rejected() {
    let (mut harness, manager) = unlocked_wallet();
    let smgr = manager.scoped_key_manager(&KEY_SCOPE_BIP0084).unwrap();

    let rng = &mut harness.rng;
    let account = update::<_, Error, _>(&harness.db, |tx| {
        let ns = tx.read_write_bucket(NS)?.ok_or(Error::NoExist)?;
        smgr.new_account(&ns, rng, "foo")
    })
    .unwrap();
    assert_eq!(account, 1);

    let err = update::<_, Error, _>(&harness.db, |tx| {
        let ns = tx.read_write_bucket(NS)?.ok_or(Error::NoExist)?;
        smgr.new_account(&ns, rng, "foo")
    })
    .unwrap_err();
    assert!(matches!(err, Error::DuplicateAccount(name) if name == "foo"));
}

#[test]
fn watching_only_rejects_private_operations() {
    let mut harness = Harness::new();
    {
        let rng = &mut harness.rng;
        update::<_, Error, _>(&harness.db, |tx| {
            let ns = tx.create_top_level_bucket(NS)?;
            Manager::create(
                &ns,
                rng,
                None,
                PUB_PASS,
                b"",
                Network::Bitcoin,
                &ScryptOptions::FAST,
                SystemTime::now(),
            )
        })
        .unwrap();
    }

    let manager = harness.open(PUB_PASS).unwrap();
    assert!(manager.watch_only());

    assert!(matches!(
        harness.unlock(&manager),
        Err(Error::WatchingOnly),
    ));

    let smgr = manager.scoped_key_manager(&KEY_SCOPE_BIP0084).unwrap();
    let rng = &mut harness.rng;
    let err = update::<_, Error, _>(&harness.db, |tx| {
        let ns = tx.read_write_bucket(NS)?.ok_or(Error::NoExist)?;
        smgr.new_account(&ns, rng, "nope").map(|_| ())
    })
    .unwrap_err();
    assert!(matches!(err, Error::WatchingOnly));
}

#[test]
fn rollback_preserves_in_memory_counters() {
    let (mut harness, manager) = unlocked_wallet();
    let smgr = manager.scoped_key_manager(&KEY_SCOPE_BIP0084).unwrap();

    // Commit one address so the counter is non-zero.
    harness.next_external(&smgr, DEFAULT_ACCOUNT_NUM, 1);

    // Derive three more, then roll the transaction back.
    {
        let rng = &mut harness.rng;
        let tx = harness.db.begin_read_write_tx().unwrap();
        let ns = tx.read_write_bucket(NS).unwrap().unwrap();
        let addrs = smgr
            .next_external_addresses(&ns, rng, DEFAULT_ACCOUNT_NUM, 3)
            .unwrap();
        assert_eq!(addrs.len(), 3);
        tx.rollback().unwrap();
    }

    // The rolled-back derivation left no trace: the next address is the
    // one right after the committed batch.
    let addrs = harness.next_external(&smgr, DEFAULT_ACCOUNT_NUM, 1);
    let path = addrs[0]
        .as_pub_key_addr()
        .unwrap()
        .derivation_path()
        .unwrap()
        .1;
    assert_eq!(path.index, 1);

    view::<_, Error, _>(&harness.db, |tx| {
        let ns = tx.read_bucket(NS)?.ok_or(Error::NoExist)?;
        let props =
            smgr.account_properties(&ns, DEFAULT_ACCOUNT_NUM)?;
        assert_eq!(props.external_key_count, 2);
        Ok(())
    })
    .unwrap();
}

#[test]
fn mark_used_is_idempotent() {
    let (mut harness, manager) = unlocked_wallet();
    let smgr = manager.scoped_key_manager(&KEY_SCOPE_BIP0084).unwrap();
    let addr = harness.next_external(&smgr, DEFAULT_ACCOUNT_NUM, 1).remove(0);

    for _ in 0..2 {
        update::<_, Error, _>(&harness.db, |tx| {
            let ns = tx.read_write_bucket(NS)?.ok_or(Error::NoExist)?;
            smgr.mark_used(&ns, &addr)
        })
        .unwrap();
    }

    view::<_, Error, _>(&harness.db, |tx| {
        let ns = tx.read_bucket(NS)?.ok_or(Error::NoExist)?;
        assert!(addr.used(&ns)?);

        // Exactly one entry in the per-scope used set.
        let scope_bucket = kv::scope_bucket(&ns, &KEY_SCOPE_BIP0084)?;
        let used = scope_bucket
            .nested_bucket(kv::USED_ADDR_BUCKET)?
            .expect("used bucket exists");
        let mut entries = 0;
        used.for_each(|_key, _value| {
            entries += 1;
            Ok::<_, Error>(())
        })?;
        assert_eq!(entries, 1);
        Ok(())
    })
    .unwrap();
}

// --- invariants --- //

#[test]
fn mark_used_does_not_mutate_address_row() {
    let (mut harness, manager) = unlocked_wallet();
    let smgr = manager.scoped_key_manager(&KEY_SCOPE_BIP0084).unwrap();
    let addr = harness.next_external(&smgr, DEFAULT_ACCOUNT_NUM, 1).remove(0);
    let addr_key = addr.addr_hash_key();

    let row_before = view::<_, Error, _>(&harness.db, |tx| {
        let ns = tx.read_bucket(NS)?.ok_or(Error::NoExist)?;
        let scope_bucket = kv::scope_bucket(&ns, &KEY_SCOPE_BIP0084)?;
        let rows = scope_bucket
            .nested_bucket(kv::ADDR_BUCKET)?
            .expect("addr bucket exists");
        Ok(rows.get(&addr_key)?.expect("row exists"))
    })
    .unwrap();

    update::<_, Error, _>(&harness.db, |tx| {
        let ns = tx.read_write_bucket(NS)?.ok_or(Error::NoExist)?;
        smgr.mark_used(&ns, &addr)
    })
    .unwrap();

    let row_after = view::<_, Error, _>(&harness.db, |tx| {
        let ns = tx.read_bucket(NS)?.ok_or(Error::NoExist)?;
        let scope_bucket = kv::scope_bucket(&ns, &KEY_SCOPE_BIP0084)?;
        let rows = scope_bucket
            .nested_bucket(kv::ADDR_BUCKET)?
            .expect("addr bucket exists");
        Ok(rows.get(&addr_key)?.expect("row exists"))
    })
    .unwrap();

    assert_eq!(row_before, row_after);
}

#[test]
fn lock_blocks_private_material_until_next_unlock() {
    let (mut harness, manager) = unlocked_wallet();
    let smgr = manager.scoped_key_manager(&KEY_SCOPE_BIP0084).unwrap();
    let addr = harness.next_external(&smgr, DEFAULT_ACCOUNT_NUM, 1).remove(0);

    let pk_addr = addr.as_pub_key_addr().unwrap();
    let secret_before = pk_addr.priv_key().unwrap();

    manager.lock().unwrap();
    assert!(manager.is_locked());
    assert!(matches!(pk_addr.priv_key(), Err(Error::Locked)));
    // Locking twice is an error, not a panic.
    assert!(matches!(manager.lock(), Err(Error::Locked)));

    harness.unlock(&manager).unwrap();
    let secret_after = pk_addr.priv_key().unwrap();
    assert_eq!(secret_before, secret_after);
}

#[test]
fn wrong_unlock_passphrase_relocks() {
    let (mut harness, manager) = unlocked_wallet();
    assert!(!manager.is_locked());

    let rng = &mut harness.rng;
    let err = update::<_, Error, _>(&harness.db, |tx| {
        let ns = tx.read_write_bucket(NS)?.ok_or(Error::NoExist)?;
        manager.unlock(&ns, rng, b"not the passphrase")
    })
    .unwrap_err();
    assert!(matches!(err, Error::WrongPassphrase));
    assert!(manager.is_locked());
}

#[test]
fn addresses_derived_while_locked_gain_keys_on_unlock() {
    let mut harness = Harness::new();
    harness.create_wallet();
    let manager = harness.open(PUB_PASS).unwrap();
    assert!(manager.is_locked());

    // Derivation works while locked, from public branch keys.
    let smgr = manager.scoped_key_manager(&KEY_SCOPE_BIP0084).unwrap();
    let addr = harness.next_external(&smgr, DEFAULT_ACCOUNT_NUM, 1).remove(0);
    let expected = independent_bip84_address(0);
    assert_eq!(addr.address().to_string(), expected.to_string());

    let pk_addr = addr.as_pub_key_addr().unwrap();
    assert!(matches!(pk_addr.priv_key(), Err(Error::Locked)));

    // The private half arrives with the unlock.
    harness.unlock(&manager).unwrap();
    let secret = pk_addr.priv_key().unwrap();
    let secp = Secp256k1::new();
    assert_eq!(&secret.public_key(&secp), pk_addr.pub_key());
}

#[test]
fn open_close_open_is_observationally_equivalent() {
    let (mut harness, manager) = unlocked_wallet();
    let smgr = manager.scoped_key_manager(&KEY_SCOPE_BIP0084).unwrap();
    let first = harness.next_external(&smgr, DEFAULT_ACCOUNT_NUM, 1);
    manager.close();

    let manager = harness.open(PUB_PASS).unwrap();
    harness.unlock(&manager).unwrap();
    let smgr = manager.scoped_key_manager(&KEY_SCOPE_BIP0084).unwrap();
    let second = harness.next_external(&smgr, DEFAULT_ACCOUNT_NUM, 1);

    // Counters persisted: the second session picks up at index 1.
    assert_eq!(first[0].address().to_string(),
        independent_bip84_address(0).to_string());
    assert_eq!(second[0].address().to_string(),
        independent_bip84_address(1).to_string());
}

#[test]
fn version_mismatch_requires_upgrade() {
    let mut harness = Harness::new();
    harness.create_wallet();

    update::<_, Error, _>(&harness.db, |tx| {
        let ns = tx.read_write_bucket(NS)?.ok_or(Error::NoExist)?;
        kv::put_manager_version(&ns, 7)
    })
    .unwrap();

    assert!(matches!(
        harness.open(PUB_PASS),
        Err(Error::Upgrade { on_disk: 7, .. }),
    ));
}

#[test]
fn change_private_passphrase() {
    let (mut harness, manager) = unlocked_wallet();
    manager.lock().unwrap();

    let new_pass = b"a brand new private passphrase";
    {
        let rng = &mut harness.rng;
        update::<_, Error, _>(&harness.db, |tx| {
            let ns = tx.read_write_bucket(NS)?.ok_or(Error::NoExist)?;
            manager.change_passphrase(
                &ns,
                rng,
                PRIV_PASS,
                new_pass,
                true,
                &ScryptOptions::FAST,
            )
        })
        .unwrap();
    }

    // The old passphrase no longer unlocks; the new one does.
    assert!(matches!(
        harness.unlock(&manager),
        Err(Error::WrongPassphrase),
    ));
    let rng = &mut harness.rng;
    update::<_, Error, _>(&harness.db, |tx| {
        let ns = tx.read_write_bucket(NS)?.ok_or(Error::NoExist)?;
        manager.unlock(&ns, rng, new_pass)
    })
    .unwrap();
    assert!(!manager.is_locked());
}

#[test]
fn imported_scripts_roundtrip() {
    let (mut harness, manager) = unlocked_wallet();
    let smgr = manager.scoped_key_manager(&KEY_SCOPE_BIP0084).unwrap();

    // OP_TRUE, as good a redeem script as any.
    let script = [0x51u8];
    let imported = {
        let rng = &mut harness.rng;
        update::<_, Error, _>(&harness.db, |tx| {
            let ns = tx.read_write_bucket(NS)?.ok_or(Error::NoExist)?;
            smgr.import_script(&ns, rng, &script)
        })
        .unwrap()
    };
    assert!(imported.imported());
    assert_eq!(imported.addr_type(), AddressType::Script);
    let got = imported.as_script_addr().unwrap().script().unwrap();
    assert_eq!(&*got, &script);

    // Importing the same script twice is rejected.
    let rng = &mut harness.rng;
    let err = update::<_, Error, _>(&harness.db, |tx| {
        let ns = tx.read_write_bucket(NS)?.ok_or(Error::NoExist)?;
        smgr.import_script(&ns, rng, &script).map(|_| ())
    })
    .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists));

    // A fresh session reads the same script back through its row.
    manager.close();
    let manager = harness.open(PUB_PASS).unwrap();
    harness.unlock(&manager).unwrap();
    let smgr = manager.scoped_key_manager(&KEY_SCOPE_BIP0084).unwrap();
    let script_addr = imported.script_address().to_vec();
    let rng = &mut harness.rng;
    let reloaded = update::<_, Error, _>(&harness.db, |tx| {
        let ns = tx.read_write_bucket(NS)?.ok_or(Error::NoExist)?;
        smgr.address(&ns, rng, &script_addr)
    })
    .unwrap();
    assert_eq!(
        reloaded.address().to_string(),
        imported.address().to_string(),
    );
    let got = reloaded.as_script_addr().unwrap().script().unwrap();
    assert_eq!(&*got, &script);
}
