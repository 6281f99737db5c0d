//! File-backed backstore: plain blocking pread/pwrite against a backing
//! image, shunted onto the device's worker pool. Demonstrates the
//! synchronous store path end to end with a short write/read/flush cycle.

use anyhow::{anyhow, Context, Result};
use clap::{Arg, Command};
use libtcmur::scsi::{opcode, sam};
use libtcmur::{
    tcmur_handle_cmd, CfgString, CmdOutcome, DeviceBuilder, DeviceInfo, IoVec, StoreCaps,
    StoreRc, StoreTask, Submit, TcmurCmd, TcmurDevice, TcmurError, TcmurStore, TcmurTransport,
};
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

struct FileStore {
    file: std::fs::File,
}

fn io_errno(e: &std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

impl TcmurStore for FileStore {
    fn caps(&self) -> StoreCaps {
        StoreCaps::FLUSH
    }

    fn open(&self, info: &DeviceInfo) -> Result<(), TcmurError> {
        let size = info.num_lbas * info.block_size as u64;
        self.file.set_len(size).map_err(TcmurError::OtherIOError)
    }

    fn read(&self, mut task: StoreTask) -> Submit {
        let mut buf = vec![0u8; task.requested()];
        match self.file.read_exact_at(&mut buf, task.offset()) {
            Ok(()) => {
                let n = task.iovec_mut().copy_from(&buf);
                task.complete(StoreRc::Bytes(n));
            }
            Err(e) => task.complete(StoreRc::Err(io_errno(&e))),
        }
        Submit::Started
    }

    fn write(&self, task: StoreTask) -> Submit {
        let mut buf = vec![0u8; task.requested()];
        let n = task.iovec().copy_to(&mut buf);
        match self.file.write_all_at(&buf[..n], task.offset()) {
            Ok(()) => task.complete(StoreRc::Bytes(n)),
            Err(e) => task.complete(StoreRc::Err(io_errno(&e))),
        }
        Submit::Started
    }

    fn flush(&self, task: StoreTask) -> Submit {
        match self.file.sync_all() {
            Ok(()) => task.complete(StoreRc::Ok),
            Err(e) => task.complete(StoreRc::Err(io_errno(&e))),
        }
        Submit::Started
    }
}

struct ChannelTransport {
    tx: Mutex<mpsc::Sender<(u8, Vec<u8>)>>,
}

impl TcmurTransport for ChannelTransport {
    fn complete(&self, _dev: &TcmurDevice, cmd: Box<TcmurCmd>, status: u8) {
        let (_cdb, iov) = cmd.into_parts();
        let data = iov.iter_slices().flatten().copied().collect();
        self.tx.lock().unwrap().send((status, data)).unwrap();
    }
}

fn rw_cdb(op: u8, lba: u32, blocks: u16) -> Vec<u8> {
    let mut cdb = vec![0u8; 10];
    cdb[0] = op;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
    cdb
}

fn main() -> Result<()> {
    env_logger::init();
    let matches = Command::new("tcmur-file")
        .about("file-backed tcmur backstore demo")
        .arg(
            Arg::new("cfgstring")
                .long("cfgstring")
                .default_value("file//tmp/tcmur-file-demo.img")
                .help("config string, file/<backing path>"),
        )
        .arg(
            Arg::new("size-mb")
                .long("size-mb")
                .default_value("16")
                .help("device size in MiB"),
        )
        .arg(
            Arg::new("workers")
                .long("workers")
                .default_value("2")
                .help("worker threads"),
        )
        .get_matches();

    let cfgstring = matches.get_one::<String>("cfgstring").unwrap().clone();
    let size_mb: u64 = matches.get_one::<String>("size-mb").unwrap().parse()?;
    let workers: usize = matches.get_one::<String>("workers").unwrap().parse()?;

    let cfg = CfgString::parse(&cfgstring)?;
    if cfg.subtype != "file" {
        return Err(anyhow!("unsupported subtype {}", cfg.subtype));
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&cfg.path)
        .with_context(|| format!("opening {}", cfg.path))?;

    let (tx, rx) = mpsc::channel();
    let transport = Arc::new(ChannelTransport { tx: Mutex::new(tx) });
    let dev = DeviceBuilder::default()
        .name("file0")
        .cfgstring(cfgstring)
        .block_size(512u32)
        .num_lbas(size_mb * 2048)
        .nr_workers(workers)
        .build(Box::new(FileStore { file }), transport)?;

    let run = |cmd: Box<TcmurCmd>| -> Result<(u8, Vec<u8>)> {
        match tcmur_handle_cmd(&dev, cmd) {
            CmdOutcome::Async => Ok(rx.recv()?),
            CmdOutcome::Done(cmd, status) => Ok((status, cmd.sense().to_vec())),
        }
    };

    let payload: Vec<u8> = (0..4096).map(|i| (i % 253) as u8).collect();

    let (status, _) = run(TcmurCmd::new(
        rw_cdb(opcode::WRITE_10, 16, 8),
        IoVec::new(vec![payload.clone()]),
    ))?;
    if status != sam::GOOD {
        return Err(anyhow!("write failed with status {:#04x}", status));
    }

    let (status, data) = run(TcmurCmd::new(rw_cdb(opcode::READ_10, 16, 8), IoVec::alloc(4096)))?;
    if status != sam::GOOD {
        return Err(anyhow!("read failed with status {:#04x}", status));
    }
    if data != payload {
        return Err(anyhow!("read back data differs from what was written"));
    }
    println!("read back verified {} bytes", payload.len());

    let (status, _) = run(TcmurCmd::new(
        vec![opcode::SYNCHRONIZE_CACHE, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        IoVec::default(),
    ))?;
    if status != sam::GOOD {
        return Err(anyhow!("flush failed with status {:#04x}", status));
    }

    dev.cleanup();
    println!("file demo done");
    Ok(())
}
