use super::*;

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("authgate-{name}-{}.json", uuid::Uuid::new_v4()))
}

#[test]
fn memory_store_set_get_remove() {
    let store = MemoryStore::new();
    assert_eq!(store.get(ACCESS_TOKEN_KEY), None);

    store.set(ACCESS_TOKEN_KEY, "tok");
    assert_eq!(store.get(ACCESS_TOKEN_KEY).as_deref(), Some("tok"));

    store.remove(ACCESS_TOKEN_KEY);
    assert_eq!(store.get(ACCESS_TOKEN_KEY), None);
}

#[test]
fn file_store_persists_across_reopen() {
    let path = temp_path("persist");
    {
        let store = FileStore::open(&path).unwrap();
        store.set(ACCESS_TOKEN_KEY, "abc");
        store.set(LAST_GOOD_MODE_KEY, "header");
    }

    let reopened = FileStore::open(&path).unwrap();
    assert_eq!(reopened.get(ACCESS_TOKEN_KEY).as_deref(), Some("abc"));
    assert_eq!(reopened.get(LAST_GOOD_MODE_KEY).as_deref(), Some("header"));

    reopened.remove(ACCESS_TOKEN_KEY);
    let again = FileStore::open(&path).unwrap();
    assert_eq!(again.get(ACCESS_TOKEN_KEY), None);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn file_store_missing_file_starts_empty() {
    let path = temp_path("missing");
    let store = FileStore::open(&path).unwrap();
    assert_eq!(store.get(REFRESH_TOKEN_KEY), None);
    assert!(!path.exists());
}

#[test]
fn file_store_corrupt_file_starts_empty_and_recovers() {
    let path = temp_path("corrupt");
    std::fs::write(&path, b"{not json").unwrap();

    let store = FileStore::open(&path).unwrap();
    assert_eq!(store.get(ACCESS_TOKEN_KEY), None);

    store.set(ACCESS_TOKEN_KEY, "fresh");
    let reopened = FileStore::open(&path).unwrap();
    assert_eq!(reopened.get(ACCESS_TOKEN_KEY).as_deref(), Some("fresh"));

    let _ = std::fs::remove_file(&path);
}
