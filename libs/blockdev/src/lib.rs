#![no_std]

/// ブロックデバイスの抽象インターフェース。
///
/// 論理セクタ番号で読み書きする。セクタサイズは構築時に決まる
/// （フラッシュならネイティブセクタサイズ）。
pub trait BlockDevice {
    /// 1 セクタのバイト数
    fn sector_size(&self) -> usize;

    /// 総セクタ数
    fn sector_count(&self) -> u64;

    /// sector から始まる連続セクタを buf に読み取る。
    /// buf 長はセクタサイズの整数倍であること。
    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<(), BlockError>;

    /// sector から始まる連続セクタへ buf を書き込む。
    /// buf 長はセクタサイズの整数倍であること。
    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<(), BlockError>;

    /// 制御チャネル。定義済みコード以外は None を返す。
    fn ioctl(&self, op: u32, _arg: u32) -> Option<u64> {
        match BlockIoctl::from_raw(op) {
            Some(BlockIoctl::SecCount) => Some(self.sector_count()),
            Some(BlockIoctl::SecSize) => Some(self.sector_size() as u64),
            None => None,
        }
    }

    /// 読み書き要求の範囲とバッファ長を検証する。
    ///
    /// buf 長がセクタサイズの倍数でなければ Misaligned、
    /// 要求範囲が [0, sector_count) に収まらなければ OutOfRange。
    /// ドライバを呼ぶ前に弾くこと。
    fn check_access(&self, sector: u64, len: usize) -> Result<(), BlockError> {
        let sec_size = self.sector_size();
        if len % sec_size != 0 {
            return Err(BlockError::Misaligned);
        }
        let nsectors = (len / sec_size) as u64;
        let count = self.sector_count();
        if sector >= count || nsectors > count - sector {
            return Err(BlockError::OutOfRange);
        }
        Ok(())
    }
}

/// ブロックデバイスエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// ドライバ層の I/O 失敗。リトライせずそのまま伝搬する
    IoError,
    /// セクタ範囲外アクセス
    OutOfRange,
    /// バッファ長がセクタサイズの倍数でない
    Misaligned,
}

/// ioctl の制御コード。定義済みは 2 つだけ。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockIoctl {
    /// 総セクタ数の問い合わせ
    SecCount = 4,
    /// セクタサイズの問い合わせ
    SecSize = 5,
}

impl BlockIoctl {
    /// 生のコードから変換する。未知のコードは None。
    pub fn from_raw(op: u32) -> Option<BlockIoctl> {
        match op {
            4 => Some(BlockIoctl::SecCount),
            5 => Some(BlockIoctl::SecSize),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedDevice {
        sector_size: usize,
        sector_count: u64,
    }

    impl BlockDevice for FixedDevice {
        fn sector_size(&self) -> usize {
            self.sector_size
        }

        fn sector_count(&self) -> u64 {
            self.sector_count
        }

        fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<(), BlockError> {
            self.check_access(sector, buf.len())
        }

        fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<(), BlockError> {
            self.check_access(sector, buf.len())
        }
    }

    #[test]
    fn test_ioctl_from_raw() {
        assert_eq!(BlockIoctl::from_raw(4), Some(BlockIoctl::SecCount));
        assert_eq!(BlockIoctl::from_raw(5), Some(BlockIoctl::SecSize));
        assert_eq!(BlockIoctl::from_raw(0), None);
        assert_eq!(BlockIoctl::from_raw(6), None);
    }

    #[test]
    fn test_ioctl_default_impl() {
        let dev = FixedDevice {
            sector_size: 512,
            sector_count: 128,
        };
        assert_eq!(dev.ioctl(BlockIoctl::SecCount as u32, 0), Some(128));
        assert_eq!(dev.ioctl(BlockIoctl::SecSize as u32, 0), Some(512));
        assert_eq!(dev.ioctl(0, 0), None);
        assert_eq!(dev.ioctl(99, 0), None);
    }

    #[test]
    fn test_check_access_ok() {
        let dev = FixedDevice {
            sector_size: 512,
            sector_count: 8,
        };
        assert!(dev.check_access(0, 512).is_ok());
        assert!(dev.check_access(7, 512).is_ok());
        // 複数セクタの連続アクセス
        assert!(dev.check_access(4, 4 * 512).is_ok());
    }

    #[test]
    fn test_check_access_misaligned() {
        let dev = FixedDevice {
            sector_size: 512,
            sector_count: 8,
        };
        assert_eq!(dev.check_access(0, 100), Err(BlockError::Misaligned));
        assert_eq!(dev.check_access(0, 513), Err(BlockError::Misaligned));
    }

    #[test]
    fn test_check_access_out_of_range() {
        let dev = FixedDevice {
            sector_size: 512,
            sector_count: 8,
        };
        assert_eq!(dev.check_access(8, 512), Err(BlockError::OutOfRange));
        // 末尾をまたぐアクセスも弾く
        assert_eq!(dev.check_access(7, 2 * 512), Err(BlockError::OutOfRange));
        assert_eq!(dev.check_access(u64::MAX, 512), Err(BlockError::OutOfRange));
    }
}
