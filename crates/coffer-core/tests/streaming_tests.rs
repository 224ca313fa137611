mod common;

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use coffer_core::crypto::hash::source_fingerprint;
use coffer_core::streaming::STREAMING_CHUNK_SIZE;
use coffer_core::{FileKind, Vault, VaultError};

use common::{PASSPHRASE, create_vault, pattern_bytes};

const CHUNK: usize = STREAMING_CHUNK_SIZE as usize;

fn chunks_of(data: &[u8]) -> Vec<Vec<u8>> {
    data.chunks(CHUNK).map(<[u8]>::to_vec).collect()
}

fn fingerprint(data: &[u8]) -> [u8; 32] {
    let first = &data[..data.len().min(1024 * 1024)];
    let last = if data.len() > 2 * 1024 * 1024 {
        Some(&data[data.len() - 1024 * 1024..])
    } else {
        None
    };
    source_fingerprint(first, last, data.len() as u64)
}

#[test]
fn streamed_import_roundtrip() {
    let (_dir, _path, mut vault) = create_vault();

    // 10 MiB: two full chunks and one half chunk.
    let data = pattern_bytes(10 * 1024 * 1024, 7);
    let (import_id, resume_from) = vault
        .streaming_start(
            "content://videos/42",
            fingerprint(&data),
            "big.mp4",
            "video/mp4",
            FileKind::Video,
            data.len() as u64,
        )
        .unwrap();
    assert_eq!(resume_from, 0);

    for (chunk_index, chunk) in chunks_of(&data).iter().enumerate() {
        let mut buf = chunk.clone();
        vault
            .streaming_write_chunk(import_id, &mut buf, chunk_index as u32)
            .unwrap();
        // The engine zeroes the plaintext before returning.
        assert!(buf.iter().all(|&b| b == 0));
    }

    let file_id = vault.streaming_finish(import_id).unwrap();

    let entry = &vault.list_files()[0];
    assert_eq!(entry.name, "big.mp4");
    assert_eq!(entry.size, data.len() as u64);
    assert_eq!(entry.chunk_count(), 3);

    let mut reassembled = Vec::new();
    for chunk_index in 0..entry.chunk_count() {
        reassembled.extend_from_slice(&vault.read_chunk(file_id, chunk_index).unwrap());
    }
    assert_eq!(reassembled, data);
}

#[test]
fn resume_after_reopen_continues_where_it_left_off() {
    let (_dir, path, mut vault) = create_vault();

    let data = pattern_bytes(10 * 1024 * 1024, 9);
    let source_hash = fingerprint(&data);
    let chunks = chunks_of(&data);

    let (import_id, resume_from) = vault
        .streaming_start(
            "content://videos/7",
            source_hash,
            "movie.mp4",
            "video/mp4",
            FileKind::Video,
            data.len() as u64,
        )
        .unwrap();
    assert_eq!(resume_from, 0);
    vault
        .streaming_write_chunk(import_id, &mut chunks[0].clone(), 0)
        .unwrap();
    vault
        .streaming_write_chunk(import_id, &mut chunks[1].clone(), 1)
        .unwrap();

    // Simulated process death: drop the handle, reopen the vault.
    vault.close();
    let mut vault = Vault::open(&path, PASSPHRASE).unwrap();

    let (resumed_id, resume_from) = vault
        .streaming_start(
            "content://videos/7",
            source_hash,
            "movie.mp4",
            "video/mp4",
            FileKind::Video,
            data.len() as u64,
        )
        .unwrap();
    assert_eq!(resumed_id, import_id);
    assert_eq!(resume_from, 2);

    vault
        .streaming_write_chunk(resumed_id, &mut chunks[2].clone(), 2)
        .unwrap();
    let file_id = vault.streaming_finish(resumed_id).unwrap();

    let mut reassembled = Vec::new();
    for chunk_index in 0..3 {
        reassembled.extend_from_slice(&vault.read_chunk(file_id, chunk_index).unwrap());
    }
    assert_eq!(reassembled, data);
}

#[test]
fn finish_requires_all_chunks() {
    let (_dir, _path, mut vault) = create_vault();

    let data = pattern_bytes(6 * 1024 * 1024, 2);
    let (import_id, _) = vault
        .streaming_start(
            "file:///src",
            fingerprint(&data),
            "half.mp4",
            "video/mp4",
            FileKind::Video,
            data.len() as u64,
        )
        .unwrap();
    vault
        .streaming_write_chunk(import_id, &mut data[..CHUNK].to_vec(), 0)
        .unwrap();

    assert!(matches!(
        vault.streaming_finish(import_id),
        Err(VaultError::InvalidParam(_))
    ));
}

#[test]
fn abort_scrubs_the_staging_directory() {
    let (dir, _path, mut vault) = create_vault();

    let data = pattern_bytes(5 * 1024 * 1024, 4);
    let (import_id, _) = vault
        .streaming_start(
            "file:///src",
            fingerprint(&data),
            "gone.mp4",
            "video/mp4",
            FileKind::Video,
            data.len() as u64,
        )
        .unwrap();
    vault
        .streaming_write_chunk(import_id, &mut data[..CHUNK].to_vec(), 0)
        .unwrap();

    let staging = dir
        .path()
        .join(".pending_imports")
        .join(import_id.to_string());
    assert!(staging.join(".state").is_file());
    assert!(staging.join("chunk_00000000.enc").is_file());

    vault.streaming_abort(import_id).unwrap();
    assert!(!staging.exists());
    assert!(vault.list_files().is_empty());

    // A second abort has nothing to act on.
    assert!(matches!(
        vault.streaming_abort(import_id),
        Err(VaultError::InvalidParam(_))
    ));
}

#[test]
fn finish_cleans_staging_and_survives_reopen() {
    let (dir, path, mut vault) = create_vault();

    let data = pattern_bytes(CHUNK + 1234, 5);
    let (import_id, _) = vault
        .streaming_start(
            "file:///src",
            fingerprint(&data),
            "doc.bin",
            "application/octet-stream",
            FileKind::Image,
            data.len() as u64,
        )
        .unwrap();
    for (chunk_index, chunk) in chunks_of(&data).iter().enumerate() {
        vault
            .streaming_write_chunk(import_id, &mut chunk.clone(), chunk_index as u32)
            .unwrap();
    }
    let file_id = vault.streaming_finish(import_id).unwrap();

    assert!(
        !dir.path()
            .join(".pending_imports")
            .join(import_id.to_string())
            .exists()
    );

    vault.close();
    let vault = Vault::open(&path, PASSPHRASE).unwrap();
    let mut reassembled = Vec::new();
    for chunk_index in 0..vault.list_files()[0].chunk_count() {
        reassembled.extend_from_slice(&vault.read_chunk(file_id, chunk_index).unwrap());
    }
    assert_eq!(reassembled, data);
}

#[test]
fn pending_listing_and_state() {
    let (_dir, _path, mut vault) = create_vault();
    assert!(vault.streaming_list_pending().unwrap().is_empty());

    let data_a = pattern_bytes(5 * 1024 * 1024, 1);
    let data_b = pattern_bytes(9 * 1024 * 1024, 2);
    let (id_a, _) = vault
        .streaming_start(
            "file:///a",
            fingerprint(&data_a),
            "a.mp4",
            "video/mp4",
            FileKind::Video,
            data_a.len() as u64,
        )
        .unwrap();
    let (id_b, _) = vault
        .streaming_start(
            "file:///b",
            fingerprint(&data_b),
            "b.mp4",
            "video/mp4",
            FileKind::Video,
            data_b.len() as u64,
        )
        .unwrap();

    let pending = vault.streaming_list_pending().unwrap();
    assert_eq!(pending.len(), 2);

    vault
        .streaming_write_chunk(id_a, &mut data_a[..CHUNK].to_vec(), 0)
        .unwrap();
    let state = vault.streaming_get_state(id_a).unwrap();
    assert_eq!(state.completed_chunks, 1);
    assert_eq!(state.total_chunks, 2);
    assert_eq!(state.name, "a.mp4");

    let state_b = vault.streaming_get_state(id_b).unwrap();
    assert_eq!(state_b.completed_chunks, 0);
    assert_eq!(state_b.total_chunks, 3);

    assert!(matches!(
        vault.streaming_get_state(coffer_core::ImportId([0xEE; 16])),
        Err(VaultError::NotFound)
    ));
}

#[test]
fn cleanup_old_removes_everything_at_age_zero() {
    let (dir, _path, mut vault) = create_vault();

    let data = pattern_bytes(5 * 1024 * 1024, 3);
    vault
        .streaming_start(
            "file:///x",
            fingerprint(&data),
            "x.mp4",
            "video/mp4",
            FileKind::Video,
            data.len() as u64,
        )
        .unwrap();

    let removed = vault.streaming_cleanup_old(0).unwrap();
    assert_eq!(removed, 1);
    assert!(
        fs::read_dir(dir.path().join(".pending_imports"))
            .unwrap()
            .next()
            .is_none()
    );

    // Fresh imports survive a bounded-age sweep.
    vault
        .streaming_start(
            "file:///x",
            fingerprint(&data),
            "x.mp4",
            "video/mp4",
            FileKind::Video,
            data.len() as u64,
        )
        .unwrap();
    assert_eq!(vault.streaming_cleanup_old(60 * 60 * 1000).unwrap(), 0);
}

#[test]
fn progress_callback_fires_per_chunk() {
    let (_dir, _path, mut vault) = create_vault();

    let data = pattern_bytes(9 * 1024 * 1024, 6);
    let (import_id, _) = vault
        .streaming_start(
            "file:///p",
            fingerprint(&data),
            "p.mp4",
            "video/mp4",
            FileKind::Video,
            data.len() as u64,
        )
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&calls);
    let total = data.len() as u64;
    vault
        .streaming_set_progress(import_id, move |progress| {
            seen.fetch_add(1, Ordering::SeqCst);
            assert_eq!(progress.total_bytes, total);
            assert_eq!(progress.chunks_completed, progress.bytes_written.div_ceil(CHUNK as u64) as u32);
        })
        .unwrap();

    for (chunk_index, chunk) in chunks_of(&data).iter().enumerate() {
        vault
            .streaming_write_chunk(import_id, &mut chunk.clone(), chunk_index as u32)
            .unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn rejects_oversized_and_malformed_requests() {
    let (_dir, _path, mut vault) = create_vault();

    assert!(matches!(
        vault.streaming_start(
            "file:///huge",
            [0; 32],
            "huge.bin",
            "application/octet-stream",
            FileKind::Video,
            51 * 1024 * 1024 * 1024,
        ),
        Err(VaultError::TooLarge)
    ));

    assert!(matches!(
        vault.streaming_start("file:///e", [1; 32], "e.bin", "x", FileKind::Video, 0),
        Err(VaultError::InvalidParam(_))
    ));

    let data = pattern_bytes(5 * 1024 * 1024, 8);
    let (import_id, _) = vault
        .streaming_start(
            "file:///m",
            fingerprint(&data),
            "m.mp4",
            "video/mp4",
            FileKind::Video,
            data.len() as u64,
        )
        .unwrap();

    // Out-of-range index and wrong chunk length are rejected up front.
    assert!(matches!(
        vault.streaming_write_chunk(import_id, &mut vec![0u8; CHUNK], 9),
        Err(VaultError::InvalidParam(_))
    ));
    assert!(matches!(
        vault.streaming_write_chunk(import_id, &mut vec![0u8; 100], 0),
        Err(VaultError::InvalidParam(_))
    ));

    assert!(matches!(
        vault.streaming_write_chunk(coffer_core::ImportId([0xAA; 16]), &mut vec![0u8; CHUNK], 0),
        Err(VaultError::NotFound)
    ));
}

#[test]
fn state_persists_on_interval_boundaries() {
    let (dir, _path, mut vault) = create_vault();

    // 12 chunks: .state is rewritten at chunk 10 and on the final chunk.
    let data = pattern_bytes(12 * CHUNK, 11);
    let (import_id, _) = vault
        .streaming_start(
            "file:///interval",
            fingerprint(&data),
            "interval.mp4",
            "video/mp4",
            FileKind::Video,
            data.len() as u64,
        )
        .unwrap();

    let state_path = dir
        .path()
        .join(".pending_imports")
        .join(import_id.to_string())
        .join(".state");
    let initial_state = fs::read(&state_path).unwrap();

    for (chunk_index, chunk) in chunks_of(&data).iter().enumerate().take(10) {
        vault
            .streaming_write_chunk(import_id, &mut chunk.clone(), chunk_index as u32)
            .unwrap();
    }
    // Ten chunks in, the persisted record has moved past the initial one.
    assert_ne!(fs::read(&state_path).unwrap(), initial_state);

    for (chunk_index, chunk) in chunks_of(&data).iter().enumerate().skip(10) {
        vault
            .streaming_write_chunk(import_id, &mut chunk.clone(), chunk_index as u32)
            .unwrap();
    }
    let file_id = vault.streaming_finish(import_id).unwrap();

    let mut reassembled = Vec::new();
    for chunk_index in 0..12 {
        reassembled.extend_from_slice(&vault.read_chunk(file_id, chunk_index).unwrap());
    }
    assert_eq!(reassembled, data);
}

#[test]
fn more_imports_than_registry_slots() {
    let (_dir, _path, mut vault) = create_vault();

    // Six sessions against a four-slot registry: the early ones are evicted
    // to disk and transparently reloaded when written to again.
    let sources: Vec<Vec<u8>> = (0..6u8)
        .map(|seed| pattern_bytes(5 * 1024 * 1024, seed.wrapping_add(40)))
        .collect();
    let mut ids = Vec::new();
    for (index, data) in sources.iter().enumerate() {
        let (import_id, resume) = vault
            .streaming_start(
                &format!("file:///multi/{index}"),
                fingerprint(data),
                &format!("multi-{index}.mp4"),
                "video/mp4",
                FileKind::Video,
                data.len() as u64,
            )
            .unwrap();
        assert_eq!(resume, 0);
        ids.push(import_id);
    }

    for (import_id, data) in ids.iter().zip(&sources) {
        for (chunk_index, chunk) in chunks_of(data).iter().enumerate() {
            vault
                .streaming_write_chunk(*import_id, &mut chunk.clone(), chunk_index as u32)
                .unwrap();
        }
    }

    let mut file_ids = Vec::new();
    for import_id in &ids {
        file_ids.push(vault.streaming_finish(*import_id).unwrap());
    }
    assert!(vault.streaming_list_pending().unwrap().is_empty());

    for (file_id, data) in file_ids.iter().zip(&sources) {
        let mut reassembled = Vec::new();
        for chunk_index in 0..2 {
            reassembled.extend_from_slice(&vault.read_chunk(*file_id, chunk_index).unwrap());
        }
        assert_eq!(&reassembled, data);
    }
}

#[test]
fn reserved_names_rejected_at_start() {
    let (_dir, _path, mut vault) = create_vault();
    let data = pattern_bytes(5 * 1024 * 1024, 1);
    assert!(matches!(
        vault.streaming_start(
            "file:///res",
            fingerprint(&data),
            "__not_allowed",
            "video/mp4",
            FileKind::Video,
            data.len() as u64,
        ),
        Err(VaultError::InvalidParam(_))
    ));
}
