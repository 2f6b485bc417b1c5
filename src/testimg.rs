//! In-memory construction of synthetic UDIF images for tests.
//!
//! The builders assemble byte-exact containers: data fork, directory
//! (XML plist or resource fork), optional signature blob, and the koly
//! trailer, with all three checksums computed for real.

use std::io::Write;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::checksum::crc32;
use crate::format::{
    ForkPair, KOLY_SIGNATURE, KOLY_SIZE, MISH_SIGNATURE, METHOD_COPY, METHOD_END,
    METHOD_LZFSE, METHOD_ZERO_FILL, METHOD_ZERO_NOCRC, METHOD_ZLIB, SECTOR_SIZE,
};

pub(crate) struct TestBlock {
    pub method: u32,
    pub sectors: u64,
    /// Bytes stored in the data fork
    pub packed: Vec<u8>,
    /// Decompressed content, for checksum computation and assertions
    pub raw: Vec<u8>,
}

impl TestBlock {
    pub fn zero(sectors: u64) -> Self {
        TestBlock {
            method: METHOD_ZERO_FILL,
            sectors,
            packed: Vec::new(),
            raw: vec![0u8; (sectors * SECTOR_SIZE) as usize],
        }
    }

    pub fn zero_no_crc(sectors: u64) -> Self {
        TestBlock {
            method: METHOD_ZERO_NOCRC,
            sectors,
            packed: Vec::new(),
            raw: vec![0u8; (sectors * SECTOR_SIZE) as usize],
        }
    }

    pub fn copy(raw: Vec<u8>) -> Self {
        assert_eq!(raw.len() % SECTOR_SIZE as usize, 0);
        TestBlock {
            method: METHOD_COPY,
            sectors: raw.len() as u64 / SECTOR_SIZE,
            packed: raw.clone(),
            raw,
        }
    }

    pub fn zlib(raw: Vec<u8>) -> Self {
        assert_eq!(raw.len() % SECTOR_SIZE as usize, 0);
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&raw).unwrap();
        let packed = encoder.finish().unwrap();
        TestBlock {
            method: METHOD_ZLIB,
            sectors: raw.len() as u64 / SECTOR_SIZE,
            packed,
            raw,
        }
    }

    pub fn bzip2(raw: Vec<u8>) -> Self {
        assert_eq!(raw.len() % SECTOR_SIZE as usize, 0);
        let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        encoder.write_all(&raw).unwrap();
        let packed = encoder.finish().unwrap();
        TestBlock {
            method: crate::format::METHOD_BZIP2,
            sectors: raw.len() as u64 / SECTOR_SIZE,
            packed,
            raw,
        }
    }

    pub fn xz(raw: Vec<u8>) -> Self {
        assert_eq!(raw.len() % SECTOR_SIZE as usize, 0);
        let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
        encoder.write_all(&raw).unwrap();
        let packed = encoder.finish().unwrap();
        TestBlock {
            method: crate::format::METHOD_XZ,
            sectors: raw.len() as u64 / SECTOR_SIZE,
            packed,
            raw,
        }
    }

    /// ADC payload encoded as plain literal runs
    pub fn adc(raw: Vec<u8>) -> Self {
        assert_eq!(raw.len() % SECTOR_SIZE as usize, 0);
        let mut packed = Vec::new();
        for run in raw.chunks(128) {
            packed.push(0x80 | (run.len() as u8 - 1));
            packed.extend_from_slice(run);
        }
        TestBlock {
            method: crate::format::METHOD_ADC,
            sectors: raw.len() as u64 / SECTOR_SIZE,
            packed,
            raw,
        }
    }

    /// An LZFSE block that is never expected to decode; the stored
    /// checksum treats its content as zeros
    pub fn lzfse_stub(sectors: u64) -> Self {
        TestBlock {
            method: METHOD_LZFSE,
            sectors,
            packed: vec![0xA5; 32],
            raw: vec![0u8; (sectors * SECTOR_SIZE) as usize],
        }
    }
}

pub(crate) struct TestPartition {
    pub name: String,
    pub blocks: Vec<TestBlock>,
}

impl TestPartition {
    pub fn new(name: &str, blocks: Vec<TestBlock>) -> Self {
        TestPartition {
            name: name.to_string(),
            blocks,
        }
    }

    /// Concatenated decompressed content
    pub fn raw_content(&self) -> Vec<u8> {
        let mut content = Vec::new();
        for block in &self.blocks {
            content.extend_from_slice(&block.raw);
        }
        content
    }
}

pub(crate) enum Layout {
    /// Trailer at the tail, XML directory
    EndKoly,
    /// Trailer at offset 0, forks behind it
    FrontKoly,
    /// Trailer at the tail, resource-fork directory, no XML
    Rsrc,
    /// EndKoly image appended after this many filler bytes
    Offset(usize),
}

/// Build a complete image for the given partitions
pub(crate) fn build_image(parts: &[TestPartition], layout: Layout) -> Vec<u8> {
    build_image_with_blob(parts, layout, None)
}

pub(crate) fn build_image_with_blob(
    parts: &[TestPartition],
    layout: Layout,
    blob: Option<&[u8]>,
) -> Vec<u8> {
    // Data fork: packed payloads in directory order
    let mut data_fork = Vec::new();
    let mut tables = Vec::new();
    let mut start_sector = 0u64;
    for part in parts {
        let start_pack_pos = data_fork.len() as u64;
        tables.push((part.name.clone(), mish_for(part, start_sector, start_pack_pos)));
        for block in &part.blocks {
            data_fork.extend_from_slice(&block.packed);
        }
        start_sector += part.blocks.iter().map(|b| b.sectors).sum::<u64>();
    }
    let sector_count = start_sector;
    let data_crc = crc32(&data_fork);

    // Master checksum folds the per-file CRC words in directory order
    let mut crc_words = Vec::new();
    for (_, table) in &tables {
        crc_words.extend_from_slice(&table[0x48..0x4C]);
    }
    let master_crc = crc32(&crc_words);

    let (prefix, front) = match layout {
        Layout::Offset(n) => (n, false),
        Layout::FrontKoly => (0, true),
        _ => (0, false),
    };
    let rsrc_dir = matches!(layout, Layout::Rsrc);

    let base = if front { KOLY_SIZE as u64 } else { 0 };
    let data_pair = ForkPair { offset: base, len: data_fork.len() as u64 };

    let directory = if rsrc_dir {
        let entries: Vec<(Option<&[u8]>, &[u8])> = tables
            .iter()
            .map(|(name, table)| {
                let name: Option<&[u8]> = if name.is_empty() { None } else { Some(name.as_bytes()) };
                (name, table.as_slice())
            })
            .collect();
        build_rsrc_fork(&entries, false)
    } else {
        plist_for(&tables)
    };
    let directory_pair = ForkPair {
        offset: base + data_fork.len() as u64,
        len: directory.len() as u64,
    };
    let (xml_pair, rsrc_pair) = if rsrc_dir {
        (ForkPair::default(), directory_pair)
    } else {
        (directory_pair, ForkPair::default())
    };

    let blob_pair = match blob {
        Some(b) => ForkPair {
            offset: directory_pair.offset + directory.len() as u64,
            len: b.len() as u64,
        },
        None => ForkPair::default(),
    };

    let koly = koly_for(
        data_pair,
        rsrc_pair,
        xml_pair,
        blob_pair,
        sector_count,
        data_crc,
        master_crc,
    );

    let mut image = vec![0xAAu8; prefix];
    if front {
        image.extend_from_slice(&koly);
        image.extend_from_slice(&data_fork);
        image.extend_from_slice(&directory);
        if let Some(b) = blob {
            image.extend_from_slice(b);
        }
    } else {
        image.extend_from_slice(&data_fork);
        image.extend_from_slice(&directory);
        if let Some(b) = blob {
            image.extend_from_slice(b);
        }
        image.extend_from_slice(&koly);
    }
    image
}

/// Serialize one partition's `mish` table
fn mish_for(part: &TestPartition, start_sector: u64, start_pack_pos: u64) -> Vec<u8> {
    let total_sectors: u64 = part.blocks.iter().map(|b| b.sectors).sum();
    let file_crc = crc32(&part.raw_content());

    let mut table = Vec::new();
    table.write_u32::<BigEndian>(MISH_SIGNATURE).unwrap();
    table.write_u32::<BigEndian>(1).unwrap();
    table.write_u64::<BigEndian>(start_sector).unwrap();
    table.write_u64::<BigEndian>(total_sectors).unwrap();
    table.write_u64::<BigEndian>(start_pack_pos).unwrap();
    table.write_u32::<BigEndian>(0).unwrap(); // buffers needed
    table.write_u32::<BigEndian>(0).unwrap(); // descriptor
    table.extend_from_slice(&[0u8; 24]);
    table.write_u32::<BigEndian>(2).unwrap(); // checksum type
    table.write_u32::<BigEndian>(32).unwrap();
    table.write_u32::<BigEndian>(file_crc).unwrap();
    table.extend_from_slice(&[0u8; 124]);
    table.write_u32::<BigEndian>(part.blocks.len() as u32 + 1).unwrap();
    assert_eq!(table.len(), 0xCC);

    let mut sector = 0u64;
    let mut pack_pos = 0u64;
    for block in &part.blocks {
        table.write_u32::<BigEndian>(block.method).unwrap();
        table.write_u32::<BigEndian>(0).unwrap();
        table.write_u64::<BigEndian>(sector).unwrap();
        table.write_u64::<BigEndian>(block.sectors).unwrap();
        table.write_u64::<BigEndian>(pack_pos).unwrap();
        table.write_u64::<BigEndian>(block.packed.len() as u64).unwrap();
        sector += block.sectors;
        pack_pos += block.packed.len() as u64;
    }
    table.write_u32::<BigEndian>(METHOD_END).unwrap();
    table.write_u32::<BigEndian>(0).unwrap();
    table.write_u64::<BigEndian>(sector).unwrap();
    table.write_u64::<BigEndian>(0).unwrap();
    table.write_u64::<BigEndian>(pack_pos).unwrap();
    table.write_u64::<BigEndian>(0).unwrap();
    table
}

/// Render the XML plist directory the way hdiutil lays it out
fn plist_for(tables: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str(
        "<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \
         \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n",
    );
    xml.push_str("<plist version=\"1.0\">\n<dict>\n");
    xml.push_str("\t<key>resource-fork</key>\n\t<dict>\n");
    xml.push_str("\t\t<key>blkx</key>\n\t\t<array>\n");
    for (index, (name, table)) in tables.iter().enumerate() {
        xml.push_str("\t\t\t<dict>\n");
        xml.push_str("\t\t\t\t<key>Attributes</key>\n\t\t\t\t<string>0x0050</string>\n");
        xml.push_str("\t\t\t\t<key>Data</key>\n\t\t\t\t<data>\n");
        let encoded = STANDARD.encode(table);
        for line in encoded.as_bytes().chunks(64) {
            xml.push_str("\t\t\t\t");
            xml.push_str(std::str::from_utf8(line).unwrap());
            xml.push('\n');
        }
        xml.push_str("\t\t\t\t</data>\n");
        xml.push_str(&format!("\t\t\t\t<key>ID</key>\n\t\t\t\t<string>{index}</string>\n"));
        xml.push_str(&format!("\t\t\t\t<key>Name</key>\n\t\t\t\t<string>{name}</string>\n"));
        xml.push_str("\t\t\t</dict>\n");
    }
    xml.push_str("\t\t</array>\n\t</dict>\n</dict>\n</plist>\n");
    xml.into_bytes()
}

/// Serialize a koly trailer with both checksum records set to CRC-32
fn koly_for(
    data_fork: ForkPair,
    rsrc_fork: ForkPair,
    xml_fork: ForkPair,
    blob_fork: ForkPair,
    sector_count: u64,
    data_crc: u32,
    master_crc: u32,
) -> Vec<u8> {
    let mut koly = vec![0u8; KOLY_SIZE];
    koly[..12].copy_from_slice(&KOLY_SIGNATURE);
    BigEndian::write_u32(&mut koly[0x0C..], 1); // flags
    BigEndian::write_u64(&mut koly[0x18..], data_fork.offset);
    BigEndian::write_u64(&mut koly[0x20..], data_fork.len);
    BigEndian::write_u64(&mut koly[0x28..], rsrc_fork.offset);
    BigEndian::write_u64(&mut koly[0x30..], rsrc_fork.len);
    BigEndian::write_u32(&mut koly[0x38..], 1); // segment number
    BigEndian::write_u32(&mut koly[0x3C..], 1); // segment count
    for (i, byte) in koly[0x40..0x50].iter_mut().enumerate() {
        *byte = 0x10 + i as u8;
    }
    BigEndian::write_u32(&mut koly[0x50..], 2);
    BigEndian::write_u32(&mut koly[0x54..], 32);
    BigEndian::write_u32(&mut koly[0x58..], data_crc);
    BigEndian::write_u64(&mut koly[0xD8..], xml_fork.offset);
    BigEndian::write_u64(&mut koly[0xE0..], xml_fork.len);
    BigEndian::write_u64(&mut koly[0x128..], blob_fork.offset);
    BigEndian::write_u64(&mut koly[0x130..], blob_fork.len);
    BigEndian::write_u32(&mut koly[0x160..], 2);
    BigEndian::write_u32(&mut koly[0x164..], 32);
    BigEndian::write_u32(&mut koly[0x168..], master_crc);
    BigEndian::write_u32(&mut koly[0x1E8..], 1); // image variant
    BigEndian::write_u64(&mut koly[0x1EC..], sector_count);
    koly
}

/// Build a SuperBlob with one CodeDirectory carrying `identifier`
pub(crate) fn build_signature_blob(identifier: &str) -> Vec<u8> {
    const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xFADE_0CC0;
    const CSMAGIC_CODEDIRECTORY: u32 = 0xFADE_0C02;

    let id_offset = 11 * 4u32;
    let cd_length = id_offset + identifier.len() as u32 + 1;

    let mut cd = Vec::new();
    cd.write_u32::<BigEndian>(CSMAGIC_CODEDIRECTORY).unwrap();
    cd.write_u32::<BigEndian>(cd_length).unwrap();
    cd.write_u32::<BigEndian>(0).unwrap(); // version
    cd.write_u32::<BigEndian>(0).unwrap(); // flags
    cd.write_u32::<BigEndian>(0).unwrap(); // hash offset
    cd.write_u32::<BigEndian>(id_offset).unwrap();
    cd.resize(id_offset as usize, 0);
    cd.extend_from_slice(identifier.as_bytes());
    cd.push(0);

    let cd_offset = 12 + 8u32; // header + one index entry
    let total = cd_offset + cd.len() as u32;

    let mut blob = Vec::new();
    blob.write_u32::<BigEndian>(CSMAGIC_EMBEDDED_SIGNATURE).unwrap();
    blob.write_u32::<BigEndian>(total).unwrap();
    blob.write_u32::<BigEndian>(1).unwrap();
    blob.write_u32::<BigEndian>(0).unwrap(); // slot type
    blob.write_u32::<BigEndian>(cd_offset).unwrap();
    blob.extend_from_slice(&cd);
    blob
}

/// Assemble a resource fork holding the given named `blkx` payloads.
/// Mirrors the layout hdiutil produced for pre-plist images.
pub(crate) fn build_rsrc_fork(entries: &[(Option<&[u8]>, &[u8])], trailing_pad: bool) -> Vec<u8> {
    const RSRC_HEAD_SIZE: u32 = 0x100;
    const BLKX_TYPE: u32 = 0x626C_6B78;

    // Main-data region: u32 length + payload per entry
    let mut main_data = Vec::new();
    let mut block_offsets = Vec::new();
    for (_, payload) in entries {
        block_offsets.push(main_data.len() as u32);
        main_data.write_u32::<BigEndian>(payload.len() as u32).unwrap();
        main_data.extend_from_slice(payload);
    }
    let main_data_size = main_data.len() as u32;
    let footer_offset = RSRC_HEAD_SIZE + main_data_size;

    // Name list and per-entry name offsets
    let mut names = Vec::new();
    let mut name_positions = Vec::new();
    for (name, _) in entries {
        match name {
            Some(bytes) => {
                name_positions.push(names.len() as u16);
                names.push(bytes.len() as u8);
                names.extend_from_slice(bytes);
            }
            None => name_positions.push(0xFFFF),
        }
    }

    let records_start = 0x1E + 8; // one type-table entry
    let names_offset = (records_start + 12 * entries.len()) as u16;
    let footer_size = names_offset as u32 + names.len() as u32;

    let mut header = Vec::new();
    header.write_u32::<BigEndian>(RSRC_HEAD_SIZE).unwrap();
    header.write_u32::<BigEndian>(footer_offset).unwrap();
    header.write_u32::<BigEndian>(main_data_size).unwrap();
    header.write_u32::<BigEndian>(footer_size).unwrap();

    let mut footer = Vec::new();
    footer.extend_from_slice(&header);
    footer.resize(0x18, 0);
    footer.write_u16::<BigEndian>(0x1C).unwrap();
    footer.write_u16::<BigEndian>(names_offset).unwrap();
    footer.write_u16::<BigEndian>(0).unwrap(); // one resource type
    footer.write_u32::<BigEndian>(BLKX_TYPE).unwrap();
    footer.write_u16::<BigEndian>(entries.len() as u16 - 1).unwrap();
    footer.write_u16::<BigEndian>((records_start - 0x1C) as u16).unwrap();
    for (k, &name_pos) in name_positions.iter().enumerate() {
        footer.write_u16::<BigEndian>(k as u16).unwrap(); // resource id
        footer.write_u16::<BigEndian>(name_pos).unwrap();
        footer.write_u32::<BigEndian>(block_offsets[k]).unwrap();
        footer.write_u32::<BigEndian>(0).unwrap();
    }
    footer.extend_from_slice(&names);
    assert_eq!(footer.len() as u32, footer_size);

    let mut rsrc = Vec::new();
    rsrc.extend_from_slice(&header);
    rsrc.resize(RSRC_HEAD_SIZE as usize, 0);
    rsrc.extend_from_slice(&main_data);
    rsrc.extend_from_slice(&footer);
    if trailing_pad {
        rsrc.extend_from_slice(&[0u8; 4]);
    }
    rsrc
}
