//! File-system syscall adapters.
//!
//! These are the kernel-side bodies a trap handler (out of scope here)
//! would dispatch `open`/`read`/`write`/... to once it has already copied
//! arguments in from user space. Every path and buffer here is a plain
//! kernel slice, not a user pointer — marshalling user memory is a
//! trap-handling concern this crate doesn't take on.

use bitflags::bitflags;

use crate::file::{FileType, RcFile};
use crate::fs::{FileName, FsTransaction, InodeGuard, Itable, Path, RcInode, Stat};
use crate::fs::{T_DEVICE, T_DIR, T_FILE};
use crate::kernel::kernel;
use crate::param::{NDEV, NOFILE};

bitflags! {
    pub struct OpenFlags: i32 {
        const O_RDONLY = 0;
        const O_WRONLY = 0x1;
        const O_RDWR = 0x2;
        const O_CREATE = 0x200;
    }
}

fn cwd() -> RcInode {
    kernel().proctable.cwd().unwrap_or_else(|| kernel().itable.root())
}

fn argfd(fd: i32) -> Result<RcFile, ()> {
    if fd < 0 || fd as usize >= NOFILE {
        return Err(());
    }
    kernel().proctable.fd(fd).ok_or(())
}

pub fn sys_dup(fd: i32) -> Result<i32, ()> {
    let f = argfd(fd)?;
    let newfile = f.dup();
    kernel().proctable.fdalloc(newfile).map_err(|_| {
        kernel().ftable.close(newfile);
    })
}

pub fn sys_read(fd: i32, dst: &mut [u8]) -> Result<usize, ()> {
    argfd(fd)?.read(dst)
}

pub fn sys_write(fd: i32, src: &[u8]) -> Result<usize, ()> {
    argfd(fd)?.write(src)
}

pub fn sys_close(fd: i32) -> Result<(), ()> {
    if fd < 0 || fd as usize >= NOFILE {
        return Err(());
    }
    let f = kernel().proctable.fdclose(fd).ok_or(())?;
    kernel().ftable.close(f);
    Ok(())
}

pub fn sys_fstat(fd: i32) -> Result<Stat, ()> {
    argfd(fd)?.stat()
}

/// Creates `new` as a link to the same inode as `old`. Fails across
/// directories or onto a directory, matching the on-disk format's
/// inability to represent either.
pub fn sys_link(old: &[u8], new: &[u8]) -> Result<(), ()> {
    let itable: &'static Itable = &kernel().itable;
    let tx = kernel().file_system.begin_transaction();

    let old_path = unsafe { Path::from_bytes(old) };
    let ip = itable.namei(&tx, cwd(), old_path).ok_or(())?;
    let mut guard = ip.lock();
    if guard.typ() == T_DIR {
        return Err(());
    }
    guard.set_nlink(guard.nlink() + 1);
    guard.update(&tx);
    drop(guard);

    let new_path = unsafe { Path::from_bytes(new) };
    let linked = itable.nameiparent(&tx, cwd(), new_path).and_then(|(dp, name)| {
        if dp.dev != ip.dev {
            return None;
        }
        let mut dguard = dp.lock();
        dguard.dirlink(&tx, name, ip.inum).ok()
    });

    if linked.is_none() {
        let mut guard = ip.lock();
        guard.set_nlink(guard.nlink() - 1);
        guard.update(&tx);
        return Err(());
    }
    Ok(())
}

pub fn sys_unlink(path: &[u8]) -> Result<(), ()> {
    let itable: &'static Itable = &kernel().itable;
    let tx = kernel().file_system.begin_transaction();
    let path = unsafe { Path::from_bytes(path) };
    let (dp, name) = itable.nameiparent(&tx, cwd(), path).ok_or(())?;

    if name.as_bytes() == b"." || name.as_bytes() == b".." {
        return Err(());
    }

    let mut dguard = dp.lock();
    let (off, ip) = dguard.dirlookup_offset(name).ok_or(())?;
    let mut iguard = ip.lock();
    assert!(iguard.nlink() >= 1, "sys_unlink: nlink < 1");
    if iguard.typ() == T_DIR && !iguard.is_dir_empty() {
        return Err(());
    }

    dguard.dirunlink_at(&tx, off);
    if iguard.typ() == T_DIR {
        dguard.set_nlink(dguard.nlink() - 1);
        dguard.update(&tx);
    }
    drop(dguard);
    drop(ip);
    iguard.set_nlink(iguard.nlink() - 1);
    iguard.update(&tx);
    Ok(())
}

/// Shared by `sys_open`'s `O_CREATE` path, `sys_mkdir`, and `sys_mknod`:
/// finds or creates `path`, applying `f` to the locked result. Runs
/// inside a transaction the caller already opened.
fn create<F, T>(
    tx: &FsTransaction<'_>,
    path: &Path,
    typ: i16,
    major: i16,
    minor: i16,
    f: F,
) -> Result<(RcInode, T), ()>
where
    F: FnOnce(&mut InodeGuard) -> T,
{
    let itable: &'static Itable = &kernel().itable;
    let (dp, name) = itable.nameiparent(tx, cwd(), path).ok_or(())?;
    let mut dguard = dp.lock();

    if let Some(ip) = dguard.dirlookup(name) {
        drop(dguard);
        let mut guard = ip.lock();
        if typ == T_FILE && (guard.typ() == T_FILE || guard.typ() == T_DEVICE) {
            let ret = f(&mut guard);
            return Ok((ip, ret));
        }
        return Err(());
    }

    let ip = itable.alloc(tx, dp.dev, typ);
    let mut guard = ip.lock();
    guard.init(typ, major, minor);
    guard.update(tx);

    if typ == T_DIR {
        dguard.set_nlink(dguard.nlink() + 1);
        dguard.update(tx);
        guard
            .dirlink(tx, unsafe { FileName::from_bytes(b".") }, ip.inum)
            .and_then(|_| guard.dirlink(tx, unsafe { FileName::from_bytes(b"..") }, dp.inum))
            .expect("create: dirlink . and ..");
    }
    dguard.dirlink(tx, name, ip.inum).expect("create: dirlink");
    let ret = f(&mut guard);
    Ok((ip, ret))
}

pub fn sys_open(path: &[u8], flags: OpenFlags) -> Result<i32, ()> {
    let path = unsafe { Path::from_bytes(path) };
    let tx = kernel().file_system.begin_transaction();

    let (ip, (typ, major)) = if flags.contains(OpenFlags::O_CREATE) {
        create(&tx, path, T_FILE, 0, 0, |ip| (ip.typ(), ip.device().0))?
    } else {
        let ip = kernel().itable.namei(&tx, cwd(), path).ok_or(())?;
        let guard = ip.lock();
        let typ = guard.typ();
        let major = guard.device().0;
        if typ == T_DIR && flags != OpenFlags::O_RDONLY {
            return Err(());
        }
        drop(guard);
        (ip, (typ, major))
    };
    drop(tx);

    if typ == T_DEVICE && major as usize >= NDEV {
        return Err(());
    }

    let filetype = if typ == T_DEVICE {
        FileType::Device { ip, major: major as u16 }
    } else {
        FileType::Inode { ip, off: 0 }
    };
    let readable = !flags.intersects(OpenFlags::O_WRONLY);
    let writable = flags.intersects(OpenFlags::O_WRONLY | OpenFlags::O_RDWR);
    let f = kernel().ftable.alloc(filetype, readable, writable).ok_or(())?;
    kernel().proctable.fdalloc(f).map_err(|_| {
        kernel().ftable.close(f);
    })
}

pub fn sys_mkdir(path: &[u8]) -> Result<(), ()> {
    let tx = kernel().file_system.begin_transaction();
    let path = unsafe { Path::from_bytes(path) };
    create(&tx, path, T_DIR, 0, 0, |_| ()).map(|_| ())
}

pub fn sys_mknod(path: &[u8], major: i16, minor: i16) -> Result<(), ()> {
    let tx = kernel().file_system.begin_transaction();
    let path = unsafe { Path::from_bytes(path) };
    create(&tx, path, T_DEVICE, major, minor, |_| ()).map(|_| ())
}

pub fn sys_chdir(path: &[u8]) -> Result<(), ()> {
    let tx = kernel().file_system.begin_transaction();
    let path = unsafe { Path::from_bytes(path) };
    let ip = kernel().itable.namei(&tx, cwd(), path).ok_or(())?;
    let guard = ip.lock();
    if guard.typ() != T_DIR {
        return Err(());
    }
    drop(guard);
    kernel().proctable.set_cwd(ip);
    Ok(())
}

pub fn sys_pipe() -> Result<(i32, i32), ()> {
    let (reader, writer) = kernel().pipes.alloc().ok_or(())?;
    let rf = kernel().ftable.alloc(FileType::Pipe(reader), true, false).ok_or(())?;
    let wf = kernel()
        .ftable
        .alloc(FileType::Pipe(writer), false, true)
        .ok_or_else(|| kernel().ftable.close(rf))?;

    let fd0 = kernel().proctable.fdalloc(rf).map_err(|_| {
        kernel().ftable.close(rf);
        kernel().ftable.close(wf);
    })?;
    let fd1 = kernel().proctable.fdalloc(wf).map_err(|_| {
        kernel().proctable.fdclose(fd0);
        kernel().ftable.close(rf);
        kernel().ftable.close(wf);
    })?;
    Ok((fd0, fd1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mkfs_for_test;
    use crate::kernel::kernel_init_for_test;

    #[test]
    fn create_write_read_and_unlink() {
        let _guard = crate::kernel::test_lock();
        kernel_init_for_test();
        mkfs_for_test();

        let fd = sys_open(b"greeting", OpenFlags::O_CREATE | OpenFlags::O_RDWR).unwrap();
        assert_eq!(sys_write(fd, b"hi there").unwrap(), 8);
        sys_close(fd).unwrap();

        let fd = sys_open(b"greeting", OpenFlags::O_RDONLY).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(sys_read(fd, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"hi there");
        let st = sys_fstat(fd).unwrap();
        assert_eq!(st.typ, T_FILE as u16);
        sys_close(fd).unwrap();

        sys_unlink(b"greeting").unwrap();
        assert!(sys_open(b"greeting", OpenFlags::O_RDONLY).is_err());
    }

    #[test]
    fn mkdir_and_chdir() {
        let _guard = crate::kernel::test_lock();
        kernel_init_for_test();
        mkfs_for_test();

        sys_mkdir(b"etc").unwrap();
        sys_chdir(b"etc").unwrap();
        let fd = sys_open(b"passwd", OpenFlags::O_CREATE | OpenFlags::O_RDWR).unwrap();
        sys_write(fd, b"root").unwrap();
        sys_close(fd).unwrap();
    }

    #[test]
    fn pipe_round_trips_through_fds() {
        let _guard = crate::kernel::test_lock();
        kernel_init_for_test();
        mkfs_for_test();

        let (rfd, wfd) = sys_pipe().unwrap();
        assert_eq!(sys_write(wfd, b"ping").unwrap(), 4);
        let mut buf = [0u8; 4];
        assert_eq!(sys_read(rfd, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ping");
        sys_close(rfd).unwrap();
        sys_close(wfd).unwrap();
    }

    #[test]
    fn dup_shares_the_same_open_file() {
        let _guard = crate::kernel::test_lock();
        kernel_init_for_test();
        mkfs_for_test();

        let fd = sys_open(b"dupped", OpenFlags::O_CREATE | OpenFlags::O_RDWR).unwrap();
        let fd2 = sys_dup(fd).unwrap();
        assert_eq!(sys_write(fd, b"abc").unwrap(), 3);
        sys_close(fd).unwrap();
        sys_close(fd2).unwrap();
    }
}
