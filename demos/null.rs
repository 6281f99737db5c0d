//! Null backstore: accepts every write, returns zeros for reads, and
//! completes everything asynchronously from a completion thread, the way a
//! cluster-backed store delivers its completions.

use anyhow::Result;
use clap::{Arg, Command};
use libtcmur::scsi::{opcode, sam};
use libtcmur::{
    tcmur_handle_cmd, CmdOutcome, DeviceBuilder, IoVec, StoreCaps, StoreRc, StoreTask, Submit,
    TcmurCmd, TcmurDevice, TcmurStore, TcmurTransport,
};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

struct NullStore;

impl NullStore {
    fn complete_later(task: StoreTask, rc: StoreRc) -> Submit {
        std::thread::spawn(move || task.complete(rc));
        Submit::Started
    }
}

impl TcmurStore for NullStore {
    fn caps(&self) -> StoreCaps {
        StoreCaps::AIO | StoreCaps::FLUSH
    }

    fn read(&self, mut task: StoreTask) -> Submit {
        let len = task.requested();
        let zeros = vec![0u8; len];
        task.iovec_mut().copy_from(&zeros);
        Self::complete_later(task, StoreRc::Bytes(len))
    }

    fn write(&self, task: StoreTask) -> Submit {
        let len = task.requested();
        Self::complete_later(task, StoreRc::Bytes(len))
    }

    fn flush(&self, task: StoreTask) -> Submit {
        Self::complete_later(task, StoreRc::Ok)
    }
}

struct ChannelTransport {
    tx: Mutex<mpsc::Sender<u8>>,
}

impl TcmurTransport for ChannelTransport {
    fn complete(&self, dev: &TcmurDevice, cmd: Box<TcmurCmd>, status: u8) {
        println!(
            "dev {}: opcode {:#04x} completed with status {:#04x}",
            dev.name(),
            cmd.cdb().first().copied().unwrap_or(0),
            status
        );
        self.tx.lock().unwrap().send(status).unwrap();
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
    let matches = Command::new("tcmur-null")
        .about("null tcmur backstore demo")
        .arg(
            Arg::new("blocks")
                .long("blocks")
                .default_value("8")
                .help("blocks per demo command"),
        )
        .get_matches();
    let blocks: u16 = matches.get_one::<String>("blocks").unwrap().parse()?;

    let (tx, rx) = mpsc::channel();
    let transport = Arc::new(ChannelTransport { tx: Mutex::new(tx) });
    let dev = DeviceBuilder::default()
        .name("null0")
        .block_size(512u32)
        .num_lbas(1u64 << 21)
        .build(Box::new(NullStore), transport)?;

    let len = blocks as usize * 512;
    let cmds = vec![
        TcmurCmd::new(rw_cdb(opcode::WRITE_10, 0, blocks), IoVec::new(vec![vec![0xab; len]])),
        TcmurCmd::new(rw_cdb(opcode::READ_10, 0, blocks), IoVec::alloc(len)),
        TcmurCmd::new(
            vec![opcode::SYNCHRONIZE_CACHE, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            IoVec::default(),
        ),
    ];

    let mut expected = 0;
    for cmd in cmds {
        match tcmur_handle_cmd(&dev, cmd) {
            CmdOutcome::Async => expected += 1,
            CmdOutcome::Done(_, status) => println!("synchronous status {:#04x}", status),
        }
    }
    for _ in 0..expected {
        let status = rx.recv()?;
        assert_eq!(status, sam::GOOD);
    }

    dev.cleanup();
    println!("null demo done");
    Ok(())
}
