use arca_types::BlobKey;

use crate::repo::commit_list::CommitList;
use crate::snapshot::{Commit, Node, Tree};
use crate::tests::helpers::date;
use crate::testutil::{test_repo, MemoryBackend};
use crate::Repo;

const DAY: i64 = 86_400_000;
const T0: i64 = 1_700_000_000_000;

/// Three commits one day apart, each parented on the previous one.
fn history(repo: &Repo) -> Vec<BlobKey> {
    let mut keys: Vec<BlobKey> = Vec::new();
    for day in 0..3 {
        let chunk = repo.put_blob(format!("day {day}").as_bytes()).unwrap();
        let mut tree = Tree::new();
        tree.insert_node("log.txt", Node::file(vec![chunk], 5));
        let tree_key = repo.put_tree(&tree).unwrap();
        let commit = Commit::new(
            tree_key,
            keys.last().cloned(),
            "/var/log",
            "server",
            date(T0 + day * DAY),
        );
        let commit_key = repo.put_commit(&commit).unwrap();
        repo.set_head_blob_key(&commit_key, keys.last(), false)
            .unwrap();
        keys.push(commit_key);
    }
    keys
}

#[test]
fn empty_bucket_has_no_history() {
    let backend = MemoryBackend::new();
    let repo = test_repo(&backend);
    let list = repo.commit_list().unwrap();
    assert!(list.is_empty());
    assert_eq!(list.newest_blob_key(), None);
    assert_eq!(list.oldest_commit_date(), None);
    assert!(!list.had_missing_blobs());
}

#[test]
fn history_is_newest_first() {
    let backend = MemoryBackend::new();
    let repo = test_repo(&backend);
    let keys = history(&repo);

    let list = repo.commit_list().unwrap();
    assert_eq!(list.len(), 3);
    let listed: Vec<_> = list.commit_blob_keys().cloned().collect();
    assert_eq!(listed, vec![keys[2].clone(), keys[1].clone(), keys[0].clone()]);
    assert_eq!(list.newest_blob_key(), Some(&keys[2]));
    assert_eq!(list.oldest_commit_date(), Some(date(T0)));
    assert_eq!(list.pairs()[1].1.creation_date, date(T0 + DAY));
}

#[test]
fn date_range_queries_are_inclusive() {
    let backend = MemoryBackend::new();
    let repo = test_repo(&backend);
    let keys = history(&repo);
    let list = repo.commit_list().unwrap();

    assert_eq!(
        list.reverse_chrono_commit_blob_keys_between(date(T0), date(T0 + DAY)),
        vec![&keys[1], &keys[0]]
    );
    assert_eq!(
        list.newest_commit_blob_key_between(date(T0), date(T0 + DAY)),
        Some(&keys[1])
    );
    assert!(list
        .reverse_chrono_commit_blob_keys_between(date(T0 + 1), date(T0 + DAY - 1))
        .is_empty());
    assert_eq!(
        list.newest_commit_blob_key_between(date(T0 + 3 * DAY), date(T0 + 4 * DAY)),
        None
    );
}

#[test]
fn dropping_a_commit_drops_everything_older() {
    let backend = MemoryBackend::new();
    let repo = test_repo(&backend);
    let keys = history(&repo);
    let mut list = repo.commit_list().unwrap();

    assert!(list.drop_commit_blob_key_and_all_older(&keys[1]));
    assert_eq!(list.len(), 1);
    assert_eq!(list.newest_blob_key(), Some(&keys[2]));
    assert_eq!(list.oldest_commit_date(), Some(date(T0 + 2 * DAY)));

    assert!(!list.drop_commit_blob_key_and_all_older(&keys[0]));
    assert_eq!(list.len(), 1);
}

#[test]
fn missing_parent_ends_the_history() {
    let backend = MemoryBackend::new();
    let repo = test_repo(&backend);
    let keys = history(&repo);
    assert!(repo.delete_blob(&keys[0]).unwrap());

    let list = CommitList::load(&repo, Some(&keys[2])).unwrap();
    assert_eq!(list.len(), 2);
    assert!(list.had_missing_blobs());
    assert_eq!(list.oldest_commit_date(), Some(date(T0 + DAY)));
}

#[test]
fn history_can_start_below_the_head() {
    let backend = MemoryBackend::new();
    let repo = test_repo(&backend);
    let keys = history(&repo);
    let list = CommitList::load(&repo, Some(&keys[1])).unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list.newest_blob_key(), Some(&keys[1]));
}
