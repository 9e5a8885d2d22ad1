//! 单例文件锁
//!
//! 使用文件锁确保只有一个守护进程实例运行：即使进程崩溃，
//! 锁也会随 fd 自动释放。

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;

/// 单例文件锁
pub struct SingletonLock {
    file: File,
    _path: PathBuf,
}

impl SingletonLock {
    /// 尝试获取单例锁（非阻塞）
    ///
    /// # 返回
    /// - `Ok(Self)` - 成功获取锁
    /// - `Err` - 锁已被其他进程持有，或文件操作失败
    pub fn try_lock(lock_path: impl AsRef<Path>) -> Result<Self, io::Error> {
        let path = lock_path.as_ref();

        // 拿到锁之前不能截断：文件里可能是持锁进程写入的 PID
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .read(true)
            .open(path)?;

        if !file.try_lock_exclusive()? {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "twibd is already running (lock held)",
            ));
        }

        // 写入当前 PID，方便排障
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(&file, "{}", std::process::id())?;
        file.sync_all()?;

        Ok(Self {
            file,
            _path: path.to_path_buf(),
        })
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        let _ = fs4::fs_std::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_excludes_second_holder() {
        let path = std::env::temp_dir().join(format!("twibd-lock-test-{}", std::process::id()));

        let lock = SingletonLock::try_lock(&path).unwrap();
        // 同一进程内第二次 flock 同一文件：独立的 fd 拿不到锁
        // （flock 语义按 open file description 计，不同 fd 互斥）
        assert!(SingletonLock::try_lock(&path).is_err());

        drop(lock);
        let _relock = SingletonLock::try_lock(&path).unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
