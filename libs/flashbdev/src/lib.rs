#![no_std]

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;

use log::{info, trace, warn};

use hazeos_blockdev::{BlockDevice, BlockError};

/// パーティションテーブル上のデータ領域 type
pub const PARTITION_TYPE_DATA: u8 = 0x01;
/// FAT データパーティションの subtype
pub const PARTITION_SUBTYPE_DATA_FAT: u8 = 0x81;
/// ファイルシステム用パーティションの既定ラベル
pub const VFS_PARTITION_LABEL: &str = "vfs";
/// これより小さいフラッシュにはファイルシステムを置かない
pub const MIN_FLASH_SIZE: u64 = 1024 * 1024;

/// パーティションの不透明ハンドル。
///
/// パーティションテーブル側が発行する。このレイヤは中身を解釈せず、
/// ドライバ呼び出しへそのまま渡す。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionHandle(pub u32);

/// パーティションテーブルのエントリ情報
#[derive(Debug, Clone)]
pub struct PartitionInfo {
    pub ptype: u8,
    pub subtype: u8,
    pub label: String,
    pub encrypted: bool,
    pub handle: PartitionHandle,
    /// パーティションサイズ（バイト）
    pub size: u64,
}

/// フラッシュドライバの抽象インターフェース。
///
/// 下位レイヤ（SPI フラッシュドライバとパーティションテーブル）が提供する。
/// 読み書き・消去は同期呼び出しで、完了するまで戻らない。
/// ハードウェア起因の失敗は IoError として返すこと。
pub trait FlashDriver {
    /// フラッシュ全体のバイト数
    fn total_size(&self) -> u64;

    /// ネイティブセクタ（消去単位）のバイト数
    fn sector_size(&self) -> usize;

    /// ファームウェア領域の直後のバイトオフセット
    fn user_start(&self) -> u64;

    /// 絶対オフセットからの読み取り
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), BlockError>;

    /// 絶対オフセットへの書き込み。対象範囲は消去済みであること
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<(), BlockError>;

    /// ネイティブセクタ番号 1 つ分の消去
    fn erase_sector(&mut self, sector: u64) -> Result<(), BlockError>;

    /// type / subtype / label が一致する最初のパーティションを返す。
    /// テーブルが無い場合も含め、見つからなければ None。
    fn find_partition(&self, ptype: u8, subtype: u8, label: &str) -> Option<PartitionInfo>;

    /// パーティション先頭からの相対オフセットで読み取る
    fn partition_read(
        &mut self,
        handle: PartitionHandle,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), BlockError>;

    /// 相対オフセットへの書き込み。対象範囲は消去済みであること
    fn partition_write(
        &mut self,
        handle: PartitionHandle,
        offset: u64,
        buf: &[u8],
    ) -> Result<(), BlockError>;

    /// 相対オフセットから len バイト分の範囲消去
    fn partition_erase_range(
        &mut self,
        handle: PartitionHandle,
        offset: u64,
        len: u64,
    ) -> Result<(), BlockError>;
}

/// 名前付きパーティションをブロックデバイスとして見せる。
///
/// オフセットは全てパーティション先頭からの相対。
pub struct PartitionBlockDevice<D: FlashDriver> {
    flash: D,
    sector_size: usize,
    label: String,
    encrypted: bool,
    handle: PartitionHandle,
    sector_count: u64,
}

impl<D: FlashDriver> PartitionBlockDevice<D> {
    /// パーティション情報からデバイスを作る。
    /// セクタサイズで割り切れない端数は切り捨てる。
    pub fn new(flash: D, part: PartitionInfo, sector_size: usize) -> Self {
        let sector_count = part.size / sector_size as u64;
        Self {
            flash,
            sector_size,
            label: part.label,
            encrypted: part.encrypted,
            handle: part.handle,
            sector_count,
        }
    }

    /// バックにあるパーティションのラベル
    pub fn label(&self) -> &str {
        &self.label
    }

    /// フラッシュ暗号化されたパーティションかどうか
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }
}

impl<D: FlashDriver> BlockDevice for PartitionBlockDevice<D> {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check_access(sector, buf.len())?;
        trace!("part:read_sectors({}, len={})", sector, buf.len());
        self.flash
            .partition_read(self.handle, sector * self.sector_size as u64, buf)
    }

    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<(), BlockError> {
        self.check_access(sector, buf.len())?;
        trace!("part:write_sectors({}, len={})", sector, buf.len());
        let offset = sector * self.sector_size as u64;
        // フラッシュは消去してからでないと書き込めない。
        // 消去に失敗したら書き込みには進まない。
        self.flash
            .partition_erase_range(self.handle, offset, buf.len() as u64)?;
        self.flash.partition_write(self.handle, offset, buf)
    }
}

/// 生フラッシュの固定領域をブロックデバイスとして見せる。
///
/// 論理セクタ 0 が物理セクタ start_sector に対応する。
pub struct RawFlashBlockDevice<D: FlashDriver> {
    flash: D,
    sector_size: usize,
    start_sector: u64,
    sector_count: u64,
}

impl<D: FlashDriver> RawFlashBlockDevice<D> {
    /// start_offset からフラッシュ末尾までを領域とする。
    /// セクタサイズで割り切れない端数は切り捨てる。
    pub fn new(flash: D, start_offset: u64, sector_size: usize) -> Self {
        let sector_count = (flash.total_size() - start_offset) / sector_size as u64;
        let start_sector = start_offset / sector_size as u64;
        Self {
            flash,
            sector_size,
            start_sector,
            sector_count,
        }
    }

    /// 論理セクタ 0 に対応する物理セクタ番号
    pub fn start_sector(&self) -> u64 {
        self.start_sector
    }
}

impl<D: FlashDriver> BlockDevice for RawFlashBlockDevice<D> {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check_access(sector, buf.len())?;
        trace!("raw:read_sectors({}, len={})", sector, buf.len());
        let phys = sector + self.start_sector;
        self.flash.read(phys * self.sector_size as u64, buf)
    }

    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<(), BlockError> {
        self.check_access(sector, buf.len())?;
        trace!("raw:write_sectors({}, len={})", sector, buf.len());
        let phys = sector + self.start_sector;
        // 生フラッシュの消去単位はネイティブセクタ 1 つ。
        // パーティション側のバイト範囲消去とは対称でない点に注意。
        self.flash.erase_sector(phys)?;
        self.flash.write(phys * self.sector_size as u64, buf)
    }
}

/// 起動時に一度だけ呼び、永続ストレージに使うブロックデバイスを決める。
///
/// 1. フラッシュが MIN_FLASH_SIZE 未満なら None（デバイスなし。エラーではない）
/// 2. "vfs" パーティションが見つかればそれを使う
/// 3. 無ければファームウェア領域の直後から末尾までを生フラッシュとして使う
///
/// パーティション探索の失敗は「見つからなかった」として 3 に落ちる。
pub fn detect<D: FlashDriver + 'static>(flash: D) -> Option<Box<dyn BlockDevice>> {
    let total = flash.total_size();
    if total < MIN_FLASH_SIZE {
        warn!("flash too small for a filesystem: {} bytes", total);
        return None;
    }

    let sector_size = flash.sector_size();
    let vfs = flash.find_partition(
        PARTITION_TYPE_DATA,
        PARTITION_SUBTYPE_DATA_FAT,
        VFS_PARTITION_LABEL,
    );
    if let Some(part) = vfs {
        info!("using partition '{}' ({} bytes)", part.label, part.size);
        return Some(Box::new(PartitionBlockDevice::new(
            flash,
            part,
            sector_size,
        )));
    }

    let start = flash.user_start();
    info!("using raw flash region {:#x}..{:#x}", start, total);
    Some(Box::new(RawFlashBlockDevice::new(flash, start, sector_size)))
}
