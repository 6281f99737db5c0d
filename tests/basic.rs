#[cfg(test)]
mod tests {
    use libtcmur::scsi::{opcode, sam, sense_key};
    use libtcmur::{
        tcmur_handle_cmd, CmdOutcome, DeviceBuilder, IoVec, StoreCaps, StoreRc, StoreTask,
        Submit, TcmurCmd, TcmurDevice, TcmurStore, TcmurTransport,
    };
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const BLOCK_SIZE: u32 = 512;
    const NUM_LBAS: u64 = 128;

    #[derive(Clone, Debug, PartialEq)]
    enum OpRecord {
        Read { off: u64, len: usize },
        Write { off: u64, len: usize, data: Vec<u8> },
        Flush,
    }

    #[derive(Default)]
    struct MemInner {
        data: Mutex<Vec<u8>>,
        ops: Mutex<Vec<OpRecord>>,
        /// errnos injected into upcoming read completions
        fail_reads: Mutex<Vec<i32>>,
        /// errnos causing upcoming reads to be rejected at submit
        reject_reads: Mutex<Vec<i32>>,
        /// flip `mask` into the read payload at this absolute offset
        corrupt_read: Mutex<Option<(usize, u8)>>,
    }

    /// In-memory backstore; with `StoreCaps::AIO` every operation completes
    /// from its own thread, otherwise it runs inline on the worker pool.
    struct MemBackstore {
        caps: StoreCaps,
        inner: Arc<MemInner>,
    }

    impl MemBackstore {
        fn new(size: usize, caps: StoreCaps) -> MemBackstore {
            let inner = MemInner {
                data: Mutex::new(vec![0u8; size]),
                ..Default::default()
            };
            MemBackstore {
                caps,
                inner: Arc::new(inner),
            }
        }
    }

    fn pop(queue: &Mutex<Vec<i32>>) -> Option<i32> {
        let mut q = queue.lock().unwrap();
        if q.is_empty() {
            None
        } else {
            Some(q.remove(0))
        }
    }

    fn exec_read(inner: &MemInner, mut task: StoreTask) {
        if let Some(errno) = pop(&inner.fail_reads) {
            task.complete(StoreRc::Err(errno));
            return;
        }
        let off = task.offset() as usize;
        let len = task.requested();
        inner.ops.lock().unwrap().push(OpRecord::Read {
            off: off as u64,
            len,
        });
        let mut buf = inner.data.lock().unwrap()[off..off + len].to_vec();
        if let Some((abs, mask)) = *inner.corrupt_read.lock().unwrap() {
            if abs >= off && abs < off + len {
                buf[abs - off] ^= mask;
            }
        }
        let n = task.iovec_mut().copy_from(&buf);
        task.complete(StoreRc::Bytes(n));
    }

    fn exec_write(inner: &MemInner, task: StoreTask) {
        let off = task.offset() as usize;
        let len = task.requested();
        let mut buf = vec![0u8; len];
        let n = task.iovec().copy_to(&mut buf);
        inner.ops.lock().unwrap().push(OpRecord::Write {
            off: off as u64,
            len,
            data: buf.clone(),
        });
        inner.data.lock().unwrap()[off..off + len].copy_from_slice(&buf);
        task.complete(StoreRc::Bytes(n));
    }

    fn exec_flush(inner: &MemInner, task: StoreTask) {
        inner.ops.lock().unwrap().push(OpRecord::Flush);
        task.complete(StoreRc::Ok);
    }

    fn exec_handle_cmd(inner: &MemInner, task: StoreTask) {
        let cdb = task.cdb().to_vec();
        if cdb[0] != opcode::WRITE_SAME_16 {
            task.complete(StoreRc::NotHandled);
            return;
        }
        let lba = u64::from_be_bytes(cdb[2..10].try_into().unwrap());
        let blocks = u32::from_be_bytes(cdb[10..14].try_into().unwrap()) as usize;
        let mut block = vec![0u8; BLOCK_SIZE as usize];
        task.iovec().copy_to(&mut block);
        let mut data = inner.data.lock().unwrap();
        for b in 0..blocks {
            let off = (lba as usize + b) * BLOCK_SIZE as usize;
            data[off..off + BLOCK_SIZE as usize].copy_from_slice(&block);
        }
        task.complete(StoreRc::Sam(sam::GOOD));
    }

    impl TcmurStore for MemBackstore {
        fn caps(&self) -> StoreCaps {
            self.caps
        }

        fn read(&self, task: StoreTask) -> Submit {
            if let Some(errno) = pop(&self.inner.reject_reads) {
                return Submit::Rejected(task, errno);
            }
            if self.caps.contains(StoreCaps::AIO) {
                let inner = self.inner.clone();
                std::thread::spawn(move || exec_read(&inner, task));
            } else {
                exec_read(&self.inner, task);
            }
            Submit::Started
        }

        fn write(&self, task: StoreTask) -> Submit {
            if self.caps.contains(StoreCaps::AIO) {
                let inner = self.inner.clone();
                std::thread::spawn(move || exec_write(&inner, task));
            } else {
                exec_write(&self.inner, task);
            }
            Submit::Started
        }

        fn flush(&self, task: StoreTask) -> Submit {
            if self.caps.contains(StoreCaps::AIO) {
                let inner = self.inner.clone();
                std::thread::spawn(move || exec_flush(&inner, task));
            } else {
                exec_flush(&self.inner, task);
            }
            Submit::Started
        }

        fn handle_cmd(&self, task: StoreTask) -> Submit {
            if self.caps.contains(StoreCaps::AIO) {
                let inner = self.inner.clone();
                std::thread::spawn(move || exec_handle_cmd(&inner, task));
            } else {
                exec_handle_cmd(&self.inner, task);
            }
            Submit::Started
        }
    }

    struct Completion {
        status: u8,
        sense: Vec<u8>,
        data: Vec<u8>,
    }

    #[derive(Default)]
    struct TestTransport {
        completions: Mutex<Vec<Completion>>,
        processing_complete: Mutex<u32>,
        lock_lost: Mutex<u32>,
        conn_lost: Mutex<u32>,
    }

    impl TestTransport {
        fn push(&self, cmd: Box<TcmurCmd>, status: u8) {
            let sense = cmd.sense().to_vec();
            let (_cdb, iov) = cmd.into_parts();
            let data = iov.iter_slices().flatten().copied().collect();
            self.completions.lock().unwrap().push(Completion {
                status,
                sense,
                data,
            });
        }

        fn wait_completions(&self, n: usize) {
            for _ in 0..1000 {
                if self.completions.lock().unwrap().len() >= n {
                    return;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            panic!("timed out waiting for {} completions", n);
        }

        fn statuses_all_good(&self) -> bool {
            self.completions
                .lock()
                .unwrap()
                .iter()
                .all(|c| c.status == sam::GOOD)
        }
    }

    impl TcmurTransport for TestTransport {
        fn complete(&self, _dev: &TcmurDevice, cmd: Box<TcmurCmd>, status: u8) {
            self.push(cmd, status);
        }

        fn processing_complete(&self, _dev: &TcmurDevice) {
            *self.processing_complete.lock().unwrap() += 1;
        }

        fn lock_lost(&self, _dev: &TcmurDevice) {
            *self.lock_lost.lock().unwrap() += 1;
        }

        fn conn_lost(&self, _dev: &TcmurDevice) {
            *self.conn_lost.lock().unwrap() += 1;
        }
    }

    fn make_dev(
        store: MemBackstore,
        nr_workers: usize,
    ) -> (Arc<TcmurDevice>, Arc<TestTransport>) {
        let transport = Arc::new(TestTransport::default());
        let dev = DeviceBuilder::default()
            .name("basic")
            .block_size(BLOCK_SIZE)
            .num_lbas(NUM_LBAS)
            .max_xfer_len(64u32)
            .nr_workers(nr_workers)
            .build(Box::new(store), transport.clone())
            .unwrap();
        (dev, transport)
    }

    /// Hand a command to the dispatcher; a synchronous status is delivered
    /// the way a real transport would deliver it.
    fn deliver(dev: &Arc<TcmurDevice>, transport: &TestTransport, cmd: Box<TcmurCmd>) {
        match tcmur_handle_cmd(dev, cmd) {
            CmdOutcome::Async => {}
            CmdOutcome::Done(cmd, status) => transport.push(cmd, status),
        }
    }

    fn read10(lba: u32, blocks: u16) -> Box<TcmurCmd> {
        let mut cdb = vec![0u8; 10];
        cdb[0] = opcode::READ_10;
        cdb[2..6].copy_from_slice(&lba.to_be_bytes());
        cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
        let len = blocks as usize * BLOCK_SIZE as usize;
        TcmurCmd::new(cdb, IoVec::alloc(len))
    }

    fn write10(lba: u32, data: Vec<u8>) -> Box<TcmurCmd> {
        let blocks = (data.len() / BLOCK_SIZE as usize) as u16;
        let mut cdb = vec![0u8; 10];
        cdb[0] = opcode::WRITE_10;
        cdb[2..6].copy_from_slice(&lba.to_be_bytes());
        cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
        TcmurCmd::new(cdb, IoVec::new(vec![data]))
    }

    fn write_verify10(lba: u32, data: Vec<u8>) -> Box<TcmurCmd> {
        let blocks = (data.len() / BLOCK_SIZE as usize) as u16;
        let mut cdb = vec![0u8; 10];
        cdb[0] = opcode::WRITE_VERIFY;
        cdb[2..6].copy_from_slice(&lba.to_be_bytes());
        cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
        TcmurCmd::new(cdb, IoVec::new(vec![data]))
    }

    fn caw16(lba: u64, blocks: u8, payload: Vec<u8>) -> Box<TcmurCmd> {
        let mut cdb = vec![0u8; 16];
        cdb[0] = opcode::COMPARE_AND_WRITE;
        cdb[2..10].copy_from_slice(&lba.to_be_bytes());
        cdb[13] = blocks;
        TcmurCmd::new(cdb, IoVec::new(vec![payload]))
    }

    fn sense_info(sense: &[u8]) -> u32 {
        u32::from_be_bytes(sense[3..7].try_into().unwrap())
    }

    /* compare-and-write */

    fn __test_caw_success(caps: StoreCaps) {
        let store = MemBackstore::new(64 * 1024, caps);
        let inner = store.inner.clone();
        inner.data.lock().unwrap()[5120..5632].fill(0xaa);
        let (dev, transport) = make_dev(store, 1);

        let mut payload = vec![0xaa; 512];
        payload.extend(std::iter::repeat(0xbb).take(512));
        deliver(&dev, &transport, caw16(10, 1, payload));
        transport.wait_completions(1);

        let comps = transport.completions.lock().unwrap();
        assert_eq!(comps[0].status, sam::GOOD);
        drop(comps);

        let ops = inner.ops.lock().unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0], OpRecord::Read { off: 5120, len: 512 });
        match &ops[1] {
            OpRecord::Write { off, len, data } => {
                assert_eq!(*off, 5120);
                assert_eq!(*len, 512);
                assert!(data.iter().all(|&b| b == 0xbb));
            }
            other => panic!("expected a write, got {:?}", other),
        }
        drop(ops);

        assert!(inner.data.lock().unwrap()[5120..5632].iter().all(|&b| b == 0xbb));
        assert_eq!(dev.in_flight(), 0);
        dev.cleanup();
    }

    #[test]
    fn test_caw_success_sync() {
        __test_caw_success(StoreCaps::empty());
    }

    #[test]
    fn test_caw_success_aio() {
        __test_caw_success(StoreCaps::AIO);
    }

    fn __test_caw_miscompare(caps: StoreCaps) {
        let store = MemBackstore::new(64 * 1024, caps);
        let inner = store.inner.clone();
        inner.data.lock().unwrap()[5120..5632].fill(0xaa);
        inner.data.lock().unwrap()[5120 + 17] = 0x00;
        let (dev, transport) = make_dev(store, 1);

        let mut payload = vec![0xaa; 512];
        payload.extend(std::iter::repeat(0xbb).take(512));
        deliver(&dev, &transport, caw16(10, 1, payload));
        transport.wait_completions(1);

        let comps = transport.completions.lock().unwrap();
        assert_eq!(comps[0].status, sam::CHECK_CONDITION);
        assert_eq!(comps[0].sense[2], sense_key::MISCOMPARE);
        assert_eq!(comps[0].sense[12], 0x1d);
        assert_eq!(sense_info(&comps[0].sense), 17);
        drop(comps);

        // no write reached the store
        let ops = inner.ops.lock().unwrap();
        assert_eq!(ops.len(), 1);
        assert!(matches!(ops[0], OpRecord::Read { .. }));
        drop(ops);

        assert_eq!(dev.in_flight(), 0);
        dev.cleanup();
    }

    #[test]
    fn test_caw_miscompare_sync() {
        __test_caw_miscompare(StoreCaps::empty());
    }

    #[test]
    fn test_caw_miscompare_aio() {
        __test_caw_miscompare(StoreCaps::AIO);
    }

    /* write and verify */

    fn wv_pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn __test_write_verify_success(caps: StoreCaps) {
        let store = MemBackstore::new(64 * 1024, caps);
        let inner = store.inner.clone();
        let (dev, transport) = make_dev(store, 1);

        let payload = wv_pattern(4096);
        deliver(&dev, &transport, write_verify10(0, payload.clone()));
        transport.wait_completions(1);

        let comps = transport.completions.lock().unwrap();
        assert_eq!(comps[0].status, sam::GOOD);
        drop(comps);

        let ops = inner.ops.lock().unwrap();
        assert_eq!(ops.len(), 2);
        match &ops[0] {
            OpRecord::Write { off, len, .. } => {
                assert_eq!(*off, 0);
                assert_eq!(*len, 4096);
            }
            other => panic!("expected a write, got {:?}", other),
        }
        assert_eq!(ops[1], OpRecord::Read { off: 0, len: 4096 });
        drop(ops);

        assert_eq!(&inner.data.lock().unwrap()[..4096], &payload[..]);
        assert_eq!(dev.in_flight(), 0);
        dev.cleanup();
    }

    #[test]
    fn test_write_verify_success_sync() {
        __test_write_verify_success(StoreCaps::empty());
    }

    #[test]
    fn test_write_verify_success_aio() {
        __test_write_verify_success(StoreCaps::AIO);
    }

    #[test]
    fn test_write_verify_miscompare() {
        let store = MemBackstore::new(64 * 1024, StoreCaps::empty());
        let inner = store.inner.clone();
        *inner.corrupt_read.lock().unwrap() = Some((2049, 0xff));
        let (dev, transport) = make_dev(store, 1);

        deliver(&dev, &transport, write_verify10(0, wv_pattern(4096)));
        transport.wait_completions(1);

        let comps = transport.completions.lock().unwrap();
        assert_eq!(comps[0].status, sam::CHECK_CONDITION);
        assert_eq!(comps[0].sense[2], sense_key::MISCOMPARE);
        assert_eq!(sense_info(&comps[0].sense), 2049);
        drop(comps);

        assert_eq!(dev.in_flight(), 0);
        dev.cleanup();
    }

    /* lock loss and connection loss */

    #[test]
    fn test_blacklisted_mid_io() {
        let store = MemBackstore::new(64 * 1024, StoreCaps::empty());
        let inner = store.inner.clone();
        inner.fail_reads.lock().unwrap().push(libc::ESHUTDOWN);
        let (dev, transport) = make_dev(store, 1);

        deliver(&dev, &transport, read10(0, 1));
        transport.wait_completions(1);

        {
            let comps = transport.completions.lock().unwrap();
            assert_eq!(comps[0].status, sam::CHECK_CONDITION);
            assert_eq!(comps[0].sense[2], sense_key::NOT_READY);
            assert_eq!(comps[0].sense[12], 0x04);
            assert_eq!(comps[0].sense[13], 0x0a);
        }
        assert_eq!(*transport.lock_lost.lock().unwrap(), 1);

        // later commands short-circuit without reaching the store
        deliver(&dev, &transport, read10(0, 1));
        transport.wait_completions(2);
        {
            let comps = transport.completions.lock().unwrap();
            assert_eq!(comps[1].status, sam::CHECK_CONDITION);
            assert_eq!(comps[1].sense[2], sense_key::NOT_READY);
        }
        assert_eq!(*transport.lock_lost.lock().unwrap(), 1);
        assert!(inner.ops.lock().unwrap().is_empty());

        assert_eq!(dev.in_flight(), 0);
        dev.cleanup();
    }

    #[test]
    fn test_timedout_mid_io() {
        let store = MemBackstore::new(64 * 1024, StoreCaps::empty());
        let inner = store.inner.clone();
        inner.fail_reads.lock().unwrap().push(libc::ETIMEDOUT);
        let (dev, transport) = make_dev(store, 1);

        deliver(&dev, &transport, read10(0, 1));
        transport.wait_completions(1);
        assert_eq!(transport.completions.lock().unwrap()[0].status, sam::BUSY);
        assert_eq!(*transport.conn_lost.lock().unwrap(), 1);

        deliver(&dev, &transport, read10(0, 1));
        transport.wait_completions(2);
        assert_eq!(transport.completions.lock().unwrap()[1].status, sam::BUSY);

        dev.cleanup();
    }

    /* concurrency on the worker pool */

    #[test]
    fn test_sync_store_concurrent_writes() {
        let store = MemBackstore::new(64 * 1024, StoreCaps::empty());
        let inner = store.inner.clone();
        let (dev, transport) = make_dev(store, 2);

        for i in 0..8u32 {
            // overlapping ranges on purpose
            deliver(&dev, &transport, write10(i % 3, vec![i as u8; 1024]));
        }
        transport.wait_completions(8);

        assert!(transport.statuses_all_good());
        assert_eq!(inner.ops.lock().unwrap().len(), 8);
        assert_eq!(dev.in_flight(), 0);
        dev.cleanup();
        assert!(*transport.processing_complete.lock().unwrap() >= 1);
    }

    /* round trip and failure injection */

    #[test]
    fn test_write_read_roundtrip() {
        let store = MemBackstore::new(64 * 1024, StoreCaps::empty());
        let (dev, transport) = make_dev(store, 1);

        let payload = wv_pattern(2048);
        deliver(&dev, &transport, write10(4, payload.clone()));
        deliver(&dev, &transport, read10(4, 4));
        transport.wait_completions(2);

        let comps = transport.completions.lock().unwrap();
        assert_eq!(comps[0].status, sam::GOOD);
        assert_eq!(comps[1].status, sam::GOOD);
        assert_eq!(comps[1].data, payload);
        drop(comps);
        dev.cleanup();
    }

    #[test]
    fn test_aio_submit_rejection_is_task_set_full() {
        let store = MemBackstore::new(64 * 1024, StoreCaps::AIO);
        let inner = store.inner.clone();
        inner.reject_reads.lock().unwrap().push(libc::ENOMEM);
        let (dev, transport) = make_dev(store, 1);

        deliver(&dev, &transport, read10(0, 1));
        // the rejection is synchronous, no store thread involved
        let comps = transport.completions.lock().unwrap();
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].status, sam::TASK_SET_FULL);
        drop(comps);
        assert_eq!(dev.in_flight(), 0);
        assert!(inner.ops.lock().unwrap().is_empty());
        dev.cleanup();
    }

    /* passthrough */

    #[test]
    fn test_write_same_passthrough() {
        let store = MemBackstore::new(
            64 * 1024,
            StoreCaps::HANDLE_CMD | StoreCaps::WRITE_SAME,
        );
        let inner = store.inner.clone();
        let (dev, transport) = make_dev(store, 1);

        let mut cdb = vec![0u8; 16];
        cdb[0] = opcode::WRITE_SAME_16;
        cdb[2..10].copy_from_slice(&2u64.to_be_bytes());
        cdb[10..14].copy_from_slice(&4u32.to_be_bytes());
        let block = vec![0x5a; BLOCK_SIZE as usize];
        deliver(&dev, &transport, TcmurCmd::new(cdb, IoVec::new(vec![block])));
        transport.wait_completions(1);

        assert_eq!(transport.completions.lock().unwrap()[0].status, sam::GOOD);
        let data = inner.data.lock().unwrap();
        assert!(data[1024..3072].iter().all(|&b| b == 0x5a));
        assert_eq!(data[1023], 0);
        assert_eq!(data[3072], 0);
        drop(data);
        dev.cleanup();
    }

    #[test]
    fn test_passthrough_decline_falls_back() {
        // the store wants first pick but declines reads; the generic
        // handler must still serve them
        let store = MemBackstore::new(
            64 * 1024,
            StoreCaps::HANDLE_CMD | StoreCaps::WRITE_SAME,
        );
        let inner = store.inner.clone();
        inner.data.lock().unwrap()[0..4].copy_from_slice(&[1, 2, 3, 4]);
        let (dev, transport) = make_dev(store, 1);

        deliver(&dev, &transport, read10(0, 1));
        transport.wait_completions(1);

        let comps = transport.completions.lock().unwrap();
        assert_eq!(comps[0].status, sam::GOOD);
        assert_eq!(&comps[0].data[..4], &[1, 2, 3, 4]);
        drop(comps);
        assert_eq!(dev.in_flight(), 0);
        dev.cleanup();
    }
}
