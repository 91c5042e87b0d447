//! End-to-end tests of the file storage and dedup/alias engine.

use std::io::Cursor;

use assert_matches::assert_matches;
use pixrepo_digest::{compute_bytes_digest, Sha1};
use pixrepo_store::file::{FinishOutcome, FileRole};
use pixrepo_store::{OpenMode, Oid, Repository, Sha1Index, StoreError};

fn repository() -> (tempfile::TempDir, Repository) {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repository::open(dir.path()).unwrap();
    (dir, repo)
}

/// Creates, fills, and seals a file object, returning the finish outcome.
fn store_file(repo: &Repository, name: &str, content: &[u8]) -> FinishOutcome {
    let mut obj = repo.new_file(name, content.len() as u64).unwrap();
    obj.write_from(&mut Cursor::new(content)).unwrap();
    repo.finish_file(obj).unwrap()
}

fn content_path(repo: &Repository, oid: Oid) -> std::path::PathBuf {
    repo.files().base().join(pixrepo_store::shard_path(oid))
}

#[test]
fn round_trip_and_digest() {
    let (_dir, repo) = repository();
    let content = b"not actually a TIFF";

    let outcome = store_file(&repo, "plate-1.tif", content);
    let FinishOutcome::Sealed(oid) = outcome else {
        panic!("fresh content should seal, got {outcome:?}");
    };

    let obj = repo.open_file(oid, OpenMode::Read).unwrap();
    assert_eq!(obj.content().unwrap(), content);
    assert_eq!(obj.info().name, "plate-1.tif");
    assert_eq!(obj.size(), content.len() as u64);
    assert_eq!(
        obj.digest().unwrap(),
        compute_bytes_digest::<Sha1>(content)
    );
    assert_eq!(obj.info().role().unwrap(), FileRole::Standalone);

    // The index maps the digest to the object.
    assert_eq!(
        repo.files_index().get(&obj.digest().unwrap()).unwrap(),
        Some(oid)
    );
}

#[test]
fn short_input_is_an_error() {
    let (_dir, repo) = repository();
    let mut obj = repo.new_file("truncated.bin", 16).unwrap();
    assert_matches!(
        obj.write_from(&mut Cursor::new(b"only 12 byte")),
        Err(StoreError::ShortTransfer { expected: 16, actual: 12 })
    );
}

#[test]
fn identical_content_and_name_merges() {
    let (_dir, repo) = repository();
    let content = b"same bytes";

    let first = store_file(&repo, "a.dat", content).oid();
    let outcome = {
        let mut obj = repo.new_file("a.dat", content.len() as u64).unwrap();
        obj.write_from(&mut Cursor::new(content)).unwrap();
        let second = obj.oid();
        let outcome = repo.finish_file(obj).unwrap();
        assert!(!repo.files().exists(second), "duplicate must be discarded");
        outcome
    };
    assert_eq!(outcome, FinishOutcome::Merged(first));
}

#[test]
fn identical_content_under_a_new_name_becomes_an_alias() {
    let (_dir, repo) = repository();
    let content = b"shared content";

    let rep_oid = store_file(&repo, "original.dat", content).oid();
    let outcome = store_file(&repo, "renamed.dat", content);
    let FinishOutcome::Aliased {
        oid: alias_oid,
        representative,
    } = outcome
    else {
        panic!("new name over known content should alias, got {outcome:?}");
    };
    assert_eq!(representative, rep_oid);

    // The alias's content file is a symbolic link at the representative.
    let link = content_path(&repo, alias_oid);
    assert!(std::fs::symlink_metadata(&link)
        .unwrap()
        .file_type()
        .is_symlink());
    // No backup file is left behind.
    assert!(!link.with_extension("bak").exists());

    // Both sides of the relationship are recorded.
    let alias_info = repo.files().read_info(alias_oid).unwrap();
    assert_eq!(
        alias_info.role().unwrap(),
        FileRole::Alias {
            representative: rep_oid
        }
    );
    let rep_info = repo.files().read_info(rep_oid).unwrap();
    assert_matches!(
        rep_info.role().unwrap(),
        FileRole::Representative { aliases } if aliases.len() == 1 && aliases[0].oid == alias_oid
    );

    // Reading the alias reads the representative's content through the
    // link.
    let alias = repo.open_file(alias_oid, OpenMode::Read).unwrap();
    assert_eq!(alias.content().unwrap(), content);

    // The index still names the representative.
    assert_eq!(
        repo.files_index().get(&alias_info.digest).unwrap(),
        Some(rep_oid)
    );

    // The same content under the alias's name now merges into the alias.
    let outcome = store_file(&repo, "renamed.dat", content);
    assert_eq!(outcome, FinishOutcome::Merged(alias_oid));
}

#[test]
fn expunging_an_alias_detaches_it() {
    let (_dir, repo) = repository();
    let content = b"alias content";

    let rep_oid = store_file(&repo, "one.dat", content).oid();
    let alias_oid = store_file(&repo, "two.dat", content).oid();

    repo.expunge_file(alias_oid).unwrap();
    assert!(!repo.files().exists(alias_oid));

    let rep_info = repo.files().read_info(rep_oid).unwrap();
    assert_eq!(rep_info.role().unwrap(), FileRole::Standalone);
    assert_eq!(
        repo.files_index().get(&rep_info.digest).unwrap(),
        Some(rep_oid)
    );
    let rep = repo.open_file(rep_oid, OpenMode::Read).unwrap();
    assert_eq!(rep.content().unwrap(), content);
}

#[test]
fn expunging_a_representative_promotes_its_first_alias() {
    let (_dir, repo) = repository();
    let content = b"promoted content";

    let rep_oid = store_file(&repo, "first.dat", content).oid();
    let promoted_oid = store_file(&repo, "second.dat", content).oid();
    let other_oid = store_file(&repo, "third.dat", content).oid();

    repo.expunge_file(rep_oid).unwrap();
    assert!(!repo.files().exists(rep_oid));

    // The promoted alias now holds the real content file.
    let promoted_content = content_path(&repo, promoted_oid);
    assert!(!std::fs::symlink_metadata(&promoted_content)
        .unwrap()
        .file_type()
        .is_symlink());
    let promoted = repo.open_file(promoted_oid, OpenMode::Read).unwrap();
    assert_eq!(promoted.content().unwrap(), content);

    // The remaining alias points (and links) at the promoted object.
    let other_info = repo.files().read_info(other_oid).unwrap();
    assert_eq!(
        other_info.role().unwrap(),
        FileRole::Alias {
            representative: promoted_oid
        }
    );
    let other = repo.open_file(other_oid, OpenMode::Read).unwrap();
    assert_eq!(other.content().unwrap(), content);

    let promoted_info = repo.files().read_info(promoted_oid).unwrap();
    assert_matches!(
        promoted_info.role().unwrap(),
        FileRole::Representative { aliases }
            if aliases.len() == 1 && aliases[0].oid == other_oid
    );

    // The index follows the content to the promoted object.
    assert_eq!(
        repo.files_index().get(&promoted_info.digest).unwrap(),
        Some(promoted_oid)
    );

    // No alias points at another alias, whatever the history.
    for oid in [promoted_oid, other_oid] {
        let info = repo.files().read_info(oid).unwrap();
        if let FileRole::Alias { representative } = info.role().unwrap() {
            let rep = repo.files().read_info(representative).unwrap();
            assert_eq!(rep.alias_of, None, "alias chain deeper than one");
        }
    }
}

#[test]
fn pixels_dependents_follow_the_content() {
    let (_dir, repo) = repository();
    let content = b"source of pixels";

    let rep_oid = store_file(&repo, "a.raw", content).oid();
    let alias_oid = store_file(&repo, "b.raw", content).oid();

    // Fake dependents; the pixels objects themselves are not needed to
    // exercise the bookkeeping.
    let dep_a = Oid::new(1001);
    let dep_b = Oid::new(1002);
    repo.files().make_pixels_dep(alias_oid, dep_a).unwrap();
    repo.files().make_pixels_dep(alias_oid, dep_b).unwrap();
    // Registering twice is a no-op.
    repo.files().make_pixels_dep(alias_oid, dep_a).unwrap();
    assert_eq!(
        repo.files().read_info(alias_oid).unwrap().deps,
        vec![dep_a, dep_b]
    );

    repo.files().remove_pixels_dep(alias_oid, dep_b).unwrap();
    assert_eq!(repo.files().read_info(alias_oid).unwrap().deps, vec![dep_a]);

    // Expunging the alias re-homes its dependents on the representative.
    repo.expunge_file(alias_oid).unwrap();
    assert_eq!(repo.files().read_info(rep_oid).unwrap().deps, vec![dep_a]);
}

#[test]
fn delete_leaves_the_index_entry_and_sealing_reclaims_it() {
    let (_dir, repo) = repository();
    let content = b"deleted then reborn";
    let digest = compute_bytes_digest::<Sha1>(content);

    let first = store_file(&repo, "gone.dat", content).oid();
    repo.delete_file(first).unwrap();
    assert!(!repo.files().exists(first));
    // DeleteFile removes files but not the digest index entry.
    assert_eq!(repo.files_index().get(&digest).unwrap(), Some(first));

    // New identical content reclaims the stale entry instead of merging
    // into the removed object.
    let outcome = store_file(&repo, "gone.dat", content);
    let FinishOutcome::Sealed(second) = outcome else {
        panic!("stale index entry should be reclaimed, got {outcome:?}");
    };
    assert_eq!(repo.files_index().get(&digest).unwrap(), Some(second));
}

#[test]
fn name_length_is_bounded() {
    let (_dir, repo) = repository();
    let long = "x".repeat(300);
    assert_matches!(
        repo.new_file(&long, 4),
        Err(StoreError::NameTooLong { len: 300, max: 255 })
    );
}
