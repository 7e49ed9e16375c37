use nufx::{
    Binary2Header, FileSystem, NufxArchive, NufxError, ThreadClass, ThreadFormat, KIND_COMMENT,
    KIND_DATA_FORK, KIND_DISK_IMAGE, KIND_FILENAME, KIND_RESOURCE_FORK,
};
use std::fs;
use std::path::Path;

const FIXTURES_DIR: &str = "tests/fixtures";

// --- Synthetic archive construction ---

struct ThreadSpec {
    class: u16,
    format: u16,
    kind: u16,
    uncompressed: u32,
    payload: Vec<u8>,
}

fn stored_thread(class: u16, kind: u16, content: &[u8]) -> ThreadSpec {
    ThreadSpec {
        class,
        format: 0, // uncompressed
        kind,
        uncompressed: content.len() as u32,
        payload: content.to_vec(),
    }
}

fn data_fork_thread(content: &[u8]) -> ThreadSpec {
    stored_thread(2, KIND_DATA_FORK, content)
}

fn resource_fork_thread(content: &[u8]) -> ThreadSpec {
    stored_thread(2, KIND_RESOURCE_FORK, content)
}

fn disk_image_thread(content: &[u8]) -> ThreadSpec {
    stored_thread(2, KIND_DISK_IMAGE, content)
}

/// Filename threads are stored with slack, the way ShrinkIt pre-allocates
/// them: the declared size is the name length, the payload is 32 bytes.
fn filename_thread(name: &str) -> ThreadSpec {
    let mut payload = name.as_bytes().to_vec();
    payload.resize(32, 0);
    ThreadSpec {
        class: 3,
        format: 0,
        kind: KIND_FILENAME,
        uncompressed: name.len() as u32,
        payload,
    }
}

fn build_record(name: &str, threads: &[ThreadSpec]) -> Vec<u8> {
    build_record_with_storage(name, 1, 0, threads)
}

fn build_record_with_storage(
    name: &str,
    storage_type: u16,
    aux_type: u32,
    threads: &[ThreadSpec],
) -> Vec<u8> {
    let mut r = Vec::new();
    r.extend_from_slice(&[0x4e, 0xf5, 0x46, 0xd8]); // "NuFX"
    r.extend_from_slice(&0u16.to_le_bytes()); // header CRC (not validated)
    r.extend_from_slice(&58u16.to_le_bytes()); // attribute count
    r.extend_from_slice(&0u16.to_le_bytes()); // record version 0
    r.extend_from_slice(&(threads.len() as u32).to_le_bytes());
    r.extend_from_slice(&1u16.to_le_bytes()); // ProDOS
    r.extend_from_slice(&(b'/' as u16).to_le_bytes()); // separator
    r.extend_from_slice(&0xe3u32.to_le_bytes()); // access
    r.extend_from_slice(&0x04u32.to_le_bytes()); // file type TXT
    r.extend_from_slice(&aux_type.to_le_bytes());
    r.extend_from_slice(&storage_type.to_le_bytes());
    r.extend_from_slice(&[0, 11, 18, 88, 5, 6, 0, 4]); // created
    r.extend_from_slice(&[0u8; 8]); // modified
    r.extend_from_slice(&[0, 30, 10, 89, 0, 0, 0, 2]); // archived
    r.extend_from_slice(&(name.len() as u16).to_le_bytes());
    r.extend_from_slice(name.as_bytes());
    for t in threads {
        r.extend_from_slice(&t.class.to_le_bytes());
        r.extend_from_slice(&t.format.to_le_bytes());
        r.extend_from_slice(&t.kind.to_le_bytes());
        r.extend_from_slice(&0u16.to_le_bytes()); // thread CRC (not validated)
        r.extend_from_slice(&t.uncompressed.to_le_bytes());
        r.extend_from_slice(&(t.payload.len() as u32).to_le_bytes());
    }
    for t in threads {
        r.extend_from_slice(&t.payload);
    }
    r
}

fn build_archive(records: &[Vec<u8>]) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&[0x4e, 0xf5, 0x46, 0xe9, 0x6c, 0xe5]); // "NuFile"
    data.extend_from_slice(&0u16.to_le_bytes()); // master CRC (not validated)
    data.extend_from_slice(&(records.len() as u32).to_le_bytes());
    data.extend_from_slice(&[0u8; 16]); // archive dates
    data.extend_from_slice(&2u16.to_le_bytes()); // master version
    data.extend_from_slice(&[0u8; 8]); // reserved
    let total: u32 = 48 + records.iter().map(|r| r.len() as u32).sum::<u32>();
    data.extend_from_slice(&total.to_be_bytes()); // total size, big-endian
    data.extend_from_slice(&[0u8; 6]);
    for r in records {
        data.extend_from_slice(r);
    }
    data
}

fn wrap_binary2(archive: &[u8], name: &str) -> Vec<u8> {
    let mut envelope = vec![0u8; Binary2Header::LEN];
    envelope[0..3].copy_from_slice(&[0x0a, 0x47, 0x4c]);
    envelope[3] = 0xe3; // access
    envelope[4] = 0xe0; // file type LBR
    envelope[5..7].copy_from_slice(&0x8002u16.to_le_bytes()); // aux: ShrinkIt
    envelope[7] = 0x01;
    envelope[18] = 0x02; // id byte
    let eof = archive.len() as u32;
    envelope[20..23].copy_from_slice(&eof.to_le_bytes()[0..3]);
    envelope[23] = name.len() as u8;
    envelope[24..24 + name.len()].copy_from_slice(name.as_bytes());
    envelope[116] = eof.to_le_bytes()[3];
    envelope[121] = 0x01; // ProDOS
    envelope[126] = 0x01;
    let mut data = envelope;
    data.extend_from_slice(archive);
    data
}

// --- Tests ---

#[test]
fn test_parse_uncompressed_archive() {
    let readme = b"Hello from a NuFX archive.".to_vec();
    let rsrc = vec![0xde, 0xad, 0xbe, 0xef, 0x00, 0x01];
    let notes = b"Second record.".to_vec();
    let data = build_archive(&[
        build_record(
            "README",
            &[data_fork_thread(&readme), resource_fork_thread(&rsrc)],
        ),
        build_record("NOTES", &[data_fork_thread(&notes)]),
    ]);

    let mut archive = NufxArchive::parse(&data).unwrap();
    assert_eq!(
        archive.records().len(),
        archive.master_header().total_records as usize
    );
    assert_eq!(archive.master_header().version, 2);
    assert_eq!(archive.master_header().total_size as usize, data.len());
    assert!(archive.binary2_header().is_none());

    assert_eq!(archive.file_name(0).unwrap(), "README");
    assert_eq!(archive.file_name(1).unwrap(), "NOTES");
    assert_eq!(archive.data_fork(0).unwrap().unwrap(), readme);
    assert_eq!(archive.resource_fork(0).unwrap().unwrap(), rsrc);
    assert_eq!(archive.data_fork(1).unwrap().unwrap(), notes);
    assert_eq!(archive.resource_fork(1).unwrap(), None);
    assert_eq!(archive.disk_image(0).unwrap(), None);

    let record = &archive.records()[0];
    assert_eq!(record.file_sys, FileSystem::ProDos);
    assert_eq!(record.separator(), '/');
    assert!(record.has_data_fork());
    assert!(record.has_resource_fork());
    assert!(!record.is_disk_image());
    let created = record.created().unwrap().unwrap();
    assert_eq!((created.year, created.month, created.day), (1988, 7, 6));
    // The third 8-byte timestamp is when the record entered the archive
    let archived = record.archived().unwrap().unwrap();
    assert_eq!((archived.year, archived.month, archived.day), (1989, 1, 1));
    assert_eq!((archived.hour, archived.minute), (10, 30));
    assert_eq!(record.modified().unwrap(), None);
}

#[test]
fn test_payload_layout_invariants() {
    let data = build_archive(&[build_record(
        "LAYOUT",
        &[
            data_fork_thread(b"0123456789"),
            resource_fork_thread(&[0xaa; 33]),
            filename_thread("layout.txt"),
        ],
    )]);
    let archive = NufxArchive::parse(&data).unwrap();
    let record = &archive.records()[0];

    // The payload area length is the sum of the compressed sizes, and each
    // thread starts where the previous ones end
    let sum: u64 = record
        .threads
        .iter()
        .map(|t| t.compressed_size as u64)
        .sum();
    assert_eq!(record.data_length, sum);
    let mut offset = record.data_offset;
    for (i, thread) in record.threads.iter().enumerate() {
        assert_eq!(record.thread_offset(i), offset);
        offset += thread.compressed_size as u64;
    }
    assert_eq!(offset, data.len() as u64);
}

#[test]
fn test_uncompressed_thread_padding() {
    // Declared size larger than stored size: the tail is zero filled
    let mut fork = data_fork_thread(b"abc");
    fork.uncompressed = 8;
    let data = build_archive(&[build_record("PAD", &[fork])]);
    let mut archive = NufxArchive::parse(&data).unwrap();
    assert_eq!(archive.data_fork(0).unwrap().unwrap(), b"abc\0\0\0\0\0");
}

#[test]
fn test_filename_thread_overrides_header() {
    let data = build_archive(&[build_record(
        "OLD.NAME",
        &[filename_thread("Real.Name"), data_fork_thread(b"x")],
    )]);
    let mut archive = NufxArchive::parse(&data).unwrap();
    assert_eq!(archive.file_name(0).unwrap(), "Real.Name");
    // The header field stays visible on the record itself
    assert_eq!(archive.records()[0].header_file_name(), "OLD.NAME");
}

#[test]
fn test_comment_thread() {
    let mut comment = stored_thread(0, KIND_COMMENT, b"uploaded by sysop\0\0\0");
    comment.uncompressed = 17;
    let data = build_archive(&[build_record("CMT", &[comment, data_fork_thread(b"y")])]);
    let mut archive = NufxArchive::parse(&data).unwrap();
    assert_eq!(archive.comment(0).unwrap().unwrap(), "uploaded by sysop");
    assert_eq!(archive.data_fork(0).unwrap().unwrap(), b"y");
}

#[test]
fn test_disk_image_extraction() {
    // A (Data, 1) thread with a declared size: two 512-byte blocks
    let image = vec![0xa5; 1024];
    let data = build_archive(&[build_record_with_storage(
        "DISK.DECL",
        512,
        2,
        &[disk_image_thread(&image)],
    )]);

    let mut archive = NufxArchive::parse(&data).unwrap();
    assert!(archive.records()[0].is_disk_image());
    assert!(!archive.records()[0].has_data_fork());
    assert_eq!(archive.disk_image(0).unwrap().unwrap(), image);
    assert_eq!(archive.data_fork(0).unwrap(), None);

    let mut sink = Vec::new();
    assert!(archive.extract_disk_image_to(0, &mut sink).unwrap());
    assert_eq!(sink, image);
}

#[test]
fn test_disk_image_zero_eof_fixup() {
    // ProDOS 8 ShrinkIt leaves the thread EOF at zero; the real size is the
    // block count times the block size from the record attributes
    let image = vec![b'D'; 1536];
    let mut thread = disk_image_thread(&image);
    thread.uncompressed = 0;
    let data = build_archive(&[build_record_with_storage("DISK.P16", 512, 3, &[thread])]);
    let mut archive = NufxArchive::parse(&data).unwrap();
    assert_eq!(archive.disk_image(0).unwrap().unwrap(), image);

    // An ordinary storage type value stands in for 512-byte blocks
    let mut thread = disk_image_thread(&image);
    thread.uncompressed = 0;
    let data = build_archive(&[build_record_with_storage("DISK.P8", 2, 3, &[thread])]);
    let mut archive = NufxArchive::parse(&data).unwrap();
    let mut sink = Vec::new();
    assert!(archive.extract_disk_image_to(0, &mut sink).unwrap());
    assert_eq!(sink, image);
}

#[test]
fn test_streaming_matches_buffered() {
    let content = b"stream me".to_vec();
    let data = build_archive(&[build_record("STRM", &[data_fork_thread(&content)])]);
    let mut archive = NufxArchive::parse(&data).unwrap();

    let mut sink = Vec::new();
    assert!(archive.extract_data_fork_to(0, &mut sink).unwrap());
    assert_eq!(sink, archive.data_fork(0).unwrap().unwrap());

    // An absent thread is not an error
    let mut sink = Vec::new();
    assert!(!archive.extract_resource_fork_to(0, &mut sink).unwrap());
    assert!(sink.is_empty());
}

#[test]
fn test_extract_generic_thread() {
    let data = build_archive(&[build_record(
        "GEN",
        &[filename_thread("gen.bin"), data_fork_thread(b"payload")],
    )]);
    let mut archive = NufxArchive::parse(&data).unwrap();
    let mut sink = Vec::new();
    assert!(archive
        .extract_thread_to(0, ThreadClass::FileName, KIND_FILENAME, &mut sink)
        .unwrap());
    assert_eq!(sink, b"gen.bin");
}

#[test]
fn test_binary2_wrap_is_transparent() {
    let content = b"wrapped content".to_vec();
    let bare = build_archive(&[build_record("WRAP", &[data_fork_thread(&content)])]);
    let wrapped = wrap_binary2(&bare, "WRAP.SHK");

    let mut outer = NufxArchive::parse(&wrapped).unwrap();
    let header = outer.binary2_header().expect("envelope metadata").clone();
    assert_eq!(header.file_name, "WRAP.SHK");
    assert_eq!(header.eof as usize, bare.len());
    assert_eq!(header.os_type, 0x01);

    // Stripping the envelope and reopening yields the same entries
    let mut inner = NufxArchive::parse(&bare).unwrap();
    assert_eq!(inner.records().len(), outer.records().len());
    assert_eq!(outer.file_name(0).unwrap(), inner.file_name(0).unwrap());
    assert_eq!(
        outer.data_fork(0).unwrap().unwrap(),
        inner.data_fork(0).unwrap().unwrap()
    );
}

#[test]
fn test_open_at_nonzero_position() {
    // The source position at open time is the archive's zero point
    let bare = build_archive(&[build_record("OFS", &[data_fork_thread(b"offset")])]);
    let mut padded = vec![0u8; 17];
    padded.extend_from_slice(&bare);

    let mut cursor = std::io::Cursor::new(padded.as_slice());
    std::io::Seek::seek(&mut cursor, std::io::SeekFrom::Start(17)).unwrap();
    let mut archive = NufxArchive::open(cursor).unwrap();
    assert_eq!(archive.data_fork(0).unwrap().unwrap(), b"offset");
}

#[test]
fn test_bad_master_signature() {
    let mut data = build_archive(&[build_record("SIG", &[data_fork_thread(b"z")])]);
    data[0] = 0x00;
    assert!(matches!(
        NufxArchive::parse(&data),
        Err(NufxError::InvalidInput(_))
    ));
}

#[test]
fn test_truncated_archive() {
    let data = build_archive(&[build_record("CUT", &[data_fork_thread(b"z")])]);
    assert!(matches!(
        NufxArchive::parse(&data[..40]),
        Err(NufxError::InvalidInput(_))
    ));
    // Cutting into the record header is also a construction failure
    assert!(matches!(
        NufxArchive::parse(&data[..60]),
        Err(NufxError::InvalidInput(_))
    ));
}

#[test]
fn test_record_count_mismatch() {
    let mut data = build_archive(&[build_record("ONE", &[data_fork_thread(b"z")])]);
    // Claim two records but store one
    data[8..12].copy_from_slice(&2u32.to_le_bytes());
    assert!(NufxArchive::parse(&data).is_err());
}

#[test]
fn test_unsupported_format_surfaces_on_extraction() {
    let mut squeezed = data_fork_thread(&[0x76, 0xff, 0x02, 0x00]);
    squeezed.format = 0x0001; // Huffman Squeeze
    let data = build_archive(&[
        build_record("SQ.FILE", &[squeezed]),
        build_record("PLAIN", &[data_fork_thread(b"fine")]),
    ]);

    let mut archive = NufxArchive::parse(&data).unwrap();
    assert_eq!(archive.records().len(), 2);
    assert_eq!(archive.records()[0].threads[0].format, ThreadFormat::HuffmanSqueeze);
    assert!(matches!(
        archive.data_fork(0),
        Err(NufxError::UnsupportedFormat(0x0001))
    ));
    // The failure is confined to that thread
    assert_eq!(archive.data_fork(1).unwrap().unwrap(), b"fine");
}

// --- Fixture corpus ---

/// Parses any real archives dropped into tests/fixtures.
#[test]
fn test_read_external_fixtures() {
    let dir = Path::new(FIXTURES_DIR);
    if !dir.exists() {
        return;
    }
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        let is_archive = path
            .extension()
            .map_or(false, |e| e == "shk" || e == "sdk" || e == "bxy");
        if !is_archive {
            continue;
        }
        let data = fs::read(&path).unwrap();
        let mut archive = NufxArchive::parse(&data)
            .unwrap_or_else(|e| panic!("failed to parse {:?}: {}", path, e));
        println!(
            "parsed {} records from {:?}",
            archive.records().len(),
            path
        );
        for index in 0..archive.records().len() {
            let _ = archive.file_name(index).unwrap();
        }
    }
}

/// Verifies extracted forks against tests/fixtures/manifest.tsv, whose
/// lines are `archive<TAB>record name<TAB>data|rsrc|disk<TAB>sha256`.
#[test]
fn test_fixture_corpus_digests() {
    use sha2::{Digest, Sha256};

    let manifest = Path::new(FIXTURES_DIR).join("manifest.tsv");
    if !manifest.exists() {
        return;
    }
    for line in fs::read_to_string(&manifest).unwrap().lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!(fields.len(), 4, "bad manifest line: {}", line);
        let (file, name, fork, want) = (fields[0], fields[1], fields[2], fields[3]);

        let data = fs::read(Path::new(FIXTURES_DIR).join(file)).unwrap();
        let mut archive = NufxArchive::parse(&data).unwrap();
        let index = (0..archive.records().len())
            .find(|&i| archive.file_name(i).unwrap() == name)
            .unwrap_or_else(|| panic!("{}: no record named {}", file, name));
        let bytes = match fork {
            "data" => archive.data_fork(index),
            "rsrc" => archive.resource_fork(index),
            "disk" => archive.disk_image(index),
            other => panic!("unknown fork column {:?}", other),
        }
        .unwrap()
        .unwrap_or_else(|| panic!("{}: {} has no {} fork", file, name, fork));

        let got: String = Sha256::digest(&bytes)
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        assert_eq!(got, want, "{}: {} {} fork digest mismatch", file, name, fork);
    }
}
