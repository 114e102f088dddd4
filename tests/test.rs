use std::sync::{
    Arc, OnceLock, Weak,
    atomic::{AtomicUsize, Ordering},
};

use kpu::{
    DmaChannel, DmaRequest, DmaTransfer, Dmac, Event, InterruptSources, JobState, Kpu, KpuConfig,
    KpuError, KpuPort, KpuTask, LAYER_WORDS, LayerArgument, Plic,
};
use spin::Mutex;

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Word(u64),
    Mask(InterruptSources),
    Clear(InterruptSources),
    EightBit(bool),
    Threshold(u8, u8),
    Select(DmaChannel, DmaRequest),
    DmaIrq(DmaChannel, bool),
    DmaClear(DmaChannel),
    Transfer(DmaChannel, DmaTransfer),
    PlicEnable(u32),
    PlicPriority(u32, u32),
}

#[derive(Default)]
struct Hw {
    ops: Vec<Op>,
    pending: InterruptSources,
    mask: InterruptSources,
}

type Shared = Arc<Mutex<Hw>>;

struct MockPort(Shared);
struct MockDmac(Shared);
struct MockPlic(Shared);

impl KpuPort for MockPort {
    fn push_layer_word(&mut self, word: u64) {
        self.0.lock().ops.push(Op::Word(word));
    }
    fn set_interrupt_mask(&mut self, masked: InterruptSources) {
        let mut hw = self.0.lock();
        hw.mask = masked;
        hw.ops.push(Op::Mask(masked));
    }
    fn clear_interrupts(&mut self, sources: InterruptSources) {
        let mut hw = self.0.lock();
        hw.pending.remove(sources);
        hw.ops.push(Op::Clear(sources));
    }
    fn pending_interrupts(&self) -> InterruptSources {
        let hw = self.0.lock();
        hw.pending.difference(hw.mask)
    }
    fn set_eight_bit_mode(&mut self, enabled: bool) {
        self.0.lock().ops.push(Op::EightBit(enabled));
    }
    fn set_fifo_threshold(&mut self, full: u8, empty: u8) {
        self.0.lock().ops.push(Op::Threshold(full, empty));
    }
}

impl Dmac for MockDmac {
    fn select_request(&mut self, channel: DmaChannel, request: DmaRequest) {
        self.0.lock().ops.push(Op::Select(channel, request));
    }
    fn set_irq_enabled(&mut self, channel: DmaChannel, enabled: bool) {
        self.0.lock().ops.push(Op::DmaIrq(channel, enabled));
    }
    fn clear_irq(&mut self, channel: DmaChannel) {
        self.0.lock().ops.push(Op::DmaClear(channel));
    }
    fn set_single_mode(&mut self, channel: DmaChannel, transfer: &DmaTransfer) {
        self.0.lock().ops.push(Op::Transfer(channel, *transfer));
    }
}

impl Plic for MockPlic {
    fn enable(&mut self, irq: u32) {
        self.0.lock().ops.push(Op::PlicEnable(irq));
    }
    fn set_priority(&mut self, irq: u32, priority: u32) {
        self.0.lock().ops.push(Op::PlicPriority(irq, priority));
    }
}

struct Bench {
    kpu: Kpu<MockPort, MockDmac, MockPlic>,
    hw: Shared,
}

impl Bench {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let hw = Shared::default();
        let kpu = Kpu::new(
            MockPort(hw.clone()),
            MockDmac(hw.clone()),
            MockPlic(hw.clone()),
            KpuConfig::default(),
        )
        .unwrap();
        kpu.init(false, None);
        hw.lock().ops.clear();
        Self { kpu, hw }
    }

    fn raise(&self, sources: InterruptSources) {
        self.hw.lock().pending.insert(sources);
        self.kpu.on_ai_irq();
    }

    fn words(&self) -> Vec<u64> {
        self.hw
            .lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::Word(w) => Some(*w),
                _ => None,
            })
            .collect()
    }

    fn transfers(&self) -> Vec<DmaTransfer> {
        self.hw
            .lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::Transfer(_, t) => Some(*t),
                _ => None,
            })
            .collect()
    }

    fn last_mask(&self) -> Option<InterruptSources> {
        self.hw.lock().ops.iter().rev().find_map(|op| match op {
            Op::Mask(m) => Some(*m),
            _ => None,
        })
    }

    /// Pretend the output DMA drained `fill` into the buffer it was given.
    fn drain_output(&self, fill: u8) {
        let out = *self.transfers().last().unwrap();
        unsafe { std::ptr::write_bytes(out.dst as *mut u64, fill, out.count) };
    }
}

/// `n` layers tagged through `image_addr`, the first reading two channels of
/// one 64-byte row each, the last sending `total_byte + 1` bytes out.
fn layers(n: usize, total_byte: u32) -> Vec<LayerArgument> {
    let mut layers: Vec<LayerArgument> = (0..n)
        .map(|i| LayerArgument {
            image_addr: i as u64,
            ..Default::default()
        })
        .collect();
    layers[0].set_input_geometry(1, 2);
    let last = layers.last_mut().unwrap();
    last.set_dma_total_byte(total_byte);
    last.set_send_data_out();
    last.set_interrupt_enabled(true);
    layers
}

fn counting_task(n: usize, counter: &Arc<AtomicUsize>) -> KpuTask {
    let counter = counter.clone();
    let mut task = KpuTask::new(layers(n, 63), DmaChannel::Ch5, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    task.init().unwrap();
    task
}

fn source() -> &'static [u8] {
    Box::leak(vec![7u8; 128].into_boxed_slice())
}

#[test]
fn init_programs_refill_mode() {
    let _ = env_logger::builder().is_test(true).try_init();
    let hw = Shared::default();
    let kpu = Kpu::new(
        MockPort(hw.clone()),
        MockDmac(hw.clone()),
        MockPlic(hw.clone()),
        KpuConfig::default(),
    )
    .unwrap();
    kpu.init(true, None);

    let ops = hw.lock().ops.clone();
    assert_eq!(
        ops,
        [
            Op::Clear(InterruptSources::all()),
            Op::Threshold(10, 1),
            Op::EightBit(true),
            Op::Mask(InterruptSources::REFILL_MASK),
            Op::PlicEnable(25),
            Op::PlicPriority(25, 1),
        ]
    );
    assert_eq!(kpu.state(), JobState::Idle);
}

#[test]
fn invalid_config_is_rejected() {
    let hw = Shared::default();
    let config = KpuConfig {
        burst_size: 0,
        ..Default::default()
    };
    let kpu = Kpu::new(
        MockPort(hw.clone()),
        MockDmac(hw.clone()),
        MockPlic(hw),
        config,
    );
    assert!(matches!(kpu, Err(KpuError::InvalidConfig(_))));
}

#[test]
fn short_chained_task_loads_in_one_burst() {
    let bench = Bench::new();
    let done = Arc::new(AtomicUsize::new(0));
    let task = counting_task(5, &done);
    let output_len = task.output_len();

    bench.kpu.run(task).unwrap();

    assert_eq!(bench.kpu.state(), JobState::BurstLoading);
    assert_eq!(bench.kpu.remaining_layers(), 0);
    assert_eq!(bench.words().len(), 5 * LAYER_WORDS);
    assert_eq!(
        bench.last_mask(),
        Some(InterruptSources::COMPLETION_ONLY_MASK)
    );

    // No source: only the output transfer is programmed.
    let config = KpuConfig::default();
    let transfers = bench.transfers();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].src, config.fifo_data_out_addr());
    assert_eq!(transfers[0].count, output_len);

    let ops = bench.hw.lock().ops.clone();
    assert!(ops.contains(&Op::Select(DmaChannel::Ch5, DmaRequest::AiRx)));
    assert!(ops.contains(&Op::Threshold(12, 1)));
    assert!(ops.contains(&Op::PlicPriority(25, 2)));
}

#[test]
fn long_task_refills_until_exhausted() {
    let bench = Bench::new();
    let done = Arc::new(AtomicUsize::new(0));
    let task = counting_task(30, &done).with_source(source());
    let input_len = task.input_len();
    assert_eq!(input_len, 16);

    bench.kpu.run(task).unwrap();
    assert_eq!(bench.kpu.state(), JobState::InputTransfer);
    assert!(bench.words().is_empty());
    let input = bench.transfers()[0];
    assert_eq!(input.dst, KpuConfig::default().ai_io_base_addr);
    assert_eq!(input.count, input_len);

    bench.kpu.on_dma_irq(DmaChannel::Ch5);
    assert_eq!(bench.kpu.state(), JobState::BurstLoading);
    assert_eq!(bench.words().len(), 12 * LAYER_WORDS);
    assert_eq!(bench.last_mask(), Some(InterruptSources::REFILL_MASK));
    assert_eq!(bench.kpu.remaining_layers(), 18);

    bench.raise(InterruptSources::LAYER_CFG_ALMOST_EMPTY);
    assert_eq!(bench.words().len(), 24 * LAYER_WORDS);
    assert_eq!(bench.kpu.remaining_layers(), 6);

    bench.raise(InterruptSources::LAYER_CFG_ALMOST_EMPTY);
    assert_eq!(bench.words().len(), 30 * LAYER_WORDS);
    assert_eq!(bench.kpu.remaining_layers(), 0);
    assert_eq!(
        bench.last_mask(),
        Some(InterruptSources::COMPLETION_ONLY_MASK)
    );

    // Descriptors reach the FIFO in task order.
    let order: Vec<u64> = bench
        .words()
        .chunks(LAYER_WORDS)
        .map(|w| w[1])
        .collect();
    assert_eq!(order, (0..30).collect::<Vec<u64>>());

    bench.raise(InterruptSources::CALC_DONE);
    assert_eq!(done.load(Ordering::SeqCst), 0);
    bench.kpu.on_dma_irq(DmaChannel::Ch5);
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(!bench.kpu.is_busy());
}

#[test]
fn completion_fires_once_in_either_order() {
    for calc_first in [true, false] {
        let bench = Bench::new();
        let done = Arc::new(AtomicUsize::new(0));
        bench.kpu.run(counting_task(3, &done)).unwrap();

        if calc_first {
            bench.raise(InterruptSources::CALC_DONE);
            assert_eq!(done.load(Ordering::SeqCst), 0);
            bench.kpu.on_dma_irq(DmaChannel::Ch5);
        } else {
            bench.kpu.on_dma_irq(DmaChannel::Ch5);
            assert_eq!(done.load(Ordering::SeqCst), 0);
            bench.raise(InterruptSources::CALC_DONE);
        }
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(bench.kpu.state(), JobState::Idle);
        assert!(!bench.kpu.is_busy());

        // Stale events after completion change nothing.
        bench.kpu.handle(Event::CalcDone);
        bench.kpu.handle(Event::OutputDmaDone);
        bench.kpu.on_dma_irq(DmaChannel::Ch5);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn callback_gets_the_drained_output() {
    let bench = Bench::new();
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let mut task = KpuTask::new(layers(2, 9), DmaChannel::Ch2, move |task: KpuTask| {
        *sink.lock() = task.output().map(|b| b.to_vec());
    });
    task.init().unwrap();

    bench.kpu.run(task).unwrap();
    bench.drain_output(0xAB);
    bench.raise(InterruptSources::CALC_DONE);
    bench.kpu.on_dma_irq(DmaChannel::Ch2);

    // 10 output bytes round up to two words.
    assert_eq!(seen.lock().as_deref(), Some(&[0xABu8; 16][..]));
}

#[test]
fn second_task_is_busy_and_handed_back() {
    let bench = Bench::new();
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    bench.kpu.run(counting_task(2, &first)).unwrap();
    let words = bench.words().len();

    let rejected = bench.kpu.run(counting_task(4, &second)).unwrap_err();
    assert_eq!(rejected.error, KpuError::Busy);
    let task = rejected.into_inner();
    assert_eq!(task.layers().len(), 4);
    assert!(task.output().is_some());
    assert_eq!(bench.words().len(), words);

    bench.raise(InterruptSources::CALC_DONE);
    bench.kpu.on_dma_irq(DmaChannel::Ch5);
    assert_eq!(first.load(Ordering::SeqCst), 1);

    // The slot is free again, so the handed-back task can now run.
    bench.kpu.run(task).unwrap();
    bench.raise(InterruptSources::CALC_DONE);
    bench.kpu.on_dma_irq(DmaChannel::Ch5);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[test]
fn malformed_tasks_do_not_take_the_slot() {
    let bench = Bench::new();

    let uninit = KpuTask::new(layers(1, 63), DmaChannel::Ch0, |_| {});
    let err = bench.kpu.run(uninit).unwrap_err();
    assert_eq!(err.error, KpuError::MalformedTask("task not initialised"));

    let mut open_ended = layers(2, 63);
    open_ended[1].set_interrupt_enabled(false);
    let mut task = KpuTask::new(open_ended, DmaChannel::Ch0, |_| {});
    task.init().unwrap();
    assert!(matches!(
        bench.kpu.run(task).unwrap_err().error,
        KpuError::MalformedTask(_)
    ));

    let mut task = KpuTask::new(layers(1, 63), DmaChannel::Ch0, |_| {})
        .with_source(&[0u8; 8]);
    task.init().unwrap();
    assert!(matches!(
        bench.kpu.run(task).unwrap_err().error,
        KpuError::MalformedTask(_)
    ));

    assert!(!bench.kpu.is_busy());
    assert!(bench.hw.lock().ops.is_empty());
}

#[test]
fn out_of_order_events_are_ignored() {
    let bench = Bench::new();
    let done = Arc::new(AtomicUsize::new(0));
    bench
        .kpu
        .run(counting_task(20, &done).with_source(source()))
        .unwrap();

    bench.kpu.handle(Event::FifoAlmostEmpty);
    bench.kpu.handle(Event::CalcDone);
    bench.kpu.handle(Event::OutputDmaDone);
    assert_eq!(bench.kpu.state(), JobState::InputTransfer);
    assert!(bench.words().is_empty());

    bench.kpu.handle(Event::InputDmaDone);
    assert_eq!(bench.kpu.state(), JobState::BurstLoading);
    bench.kpu.handle(Event::InputDmaDone);
    assert_eq!(bench.words().len(), 12 * LAYER_WORDS);

    // Calc-done from a mid-task layer does not count towards completion.
    bench.kpu.handle(Event::CalcDone);
    bench.kpu.handle(Event::OutputDmaDone);
    assert_eq!(done.load(Ordering::SeqCst), 0);
    assert!(bench.kpu.is_busy());

    bench.raise(InterruptSources::LAYER_CFG_ALMOST_EMPTY);
    bench.raise(InterruptSources::CALC_DONE);
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

#[test]
fn idle_interrupts_reach_the_user_handler() {
    let _ = env_logger::builder().is_test(true).try_init();
    let hw = Shared::default();
    let kpu = Kpu::new(
        MockPort(hw.clone()),
        MockDmac(hw.clone()),
        MockPlic(hw.clone()),
        KpuConfig::default(),
    )
    .unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    kpu.init(
        false,
        Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    );

    hw.lock().pending.insert(InterruptSources::CALC_DONE);
    kpu.on_ai_irq();
    kpu.on_ai_irq();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(hw.lock().pending.is_empty());

    // While a task runs, the loader owns the line; afterwards it is handed back.
    let done = Arc::new(AtomicUsize::new(0));
    kpu.run(counting_task(1, &done)).unwrap();
    hw.lock().pending.insert(InterruptSources::CALC_DONE);
    kpu.on_ai_irq();
    kpu.on_dma_irq(DmaChannel::Ch5);
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    kpu.on_ai_irq();
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[test]
fn conv2d_pushes_one_descriptor() {
    let bench = Bench::new();
    let layer = layers(1, 63).remove(0);
    bench.kpu.conv2d(&layer).unwrap();

    assert_eq!(bench.words(), layer.words());
    assert_eq!(bench.last_mask(), Some(InterruptSources::REFILL_MASK));
}

#[test]
fn conv2d_output_streams_into_dest() {
    let bench = Bench::new();
    let mut layer = LayerArgument::default();
    layer.set_dma_total_byte(15);
    let mut dest = vec![0u64; 2];
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();

    unsafe {
        bench
            .kpu
            .conv2d_output(
                &mut layer,
                DmaChannel::Ch3,
                &mut dest,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
    }

    let out = *bench.transfers().last().unwrap();
    assert_eq!(out.count, 2);
    assert_eq!(out.dst, dest.as_ptr() as usize);
    assert!(
        bench
            .hw
            .lock()
            .ops
            .contains(&Op::Select(DmaChannel::Ch3, DmaRequest::AiRx))
    );
    // The pushed descriptor has send-data-out set.
    assert_eq!(bench.words()[11] & 1, 1);
    assert_eq!(bench.last_mask(), Some(InterruptSources::all()));

    bench.kpu.on_dma_irq(DmaChannel::Ch3);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    bench.kpu.on_dma_irq(DmaChannel::Ch3);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn full_add_moves_one_word_per_channel() {
    let bench = Bench::new();
    let mut layer = LayerArgument::default();
    layer.set_output_channels(10);
    let mut short = vec![0u64; 9];
    let err = unsafe {
        bench
            .kpu
            .conv2d_output_full_add(&mut layer, DmaChannel::Ch1, &mut short, Box::new(|| {}))
    };
    assert_eq!(
        err,
        Err(KpuError::BufferTooSmall {
            needed: 10,
            actual: 9
        })
    );
    assert_eq!(layer.interrupt_enable, 0);

    let mut dest = vec![0u64; 10];
    unsafe {
        bench
            .kpu
            .conv2d_output_full_add(&mut layer, DmaChannel::Ch1, &mut dest, Box::new(|| {}))
            .unwrap();
    }
    assert_eq!(bench.transfers().last().unwrap().count, 10);
    assert_eq!(layer.interrupt_enable & 0b100, 0b100);
}

#[test]
fn input_dma_targets_the_layer_source_row() {
    let bench = Bench::new();
    let mut layer = layers(1, 63).remove(0);
    layer.set_image_src_addr(3);
    let src = vec![1u8; 128];
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();

    unsafe {
        bench
            .kpu
            .input_dma(
                &layer,
                &src,
                DmaChannel::Ch0,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
    }
    let t = bench.transfers()[0];
    assert_eq!(t.dst, KpuConfig::default().ai_io_base_addr + 3 * 64);
    assert_eq!(t.count, 16);

    bench.kpu.on_dma_irq(DmaChannel::Ch0);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    let err = unsafe {
        bench
            .kpu
            .input_dma(&layer, &src[..64], DmaChannel::Ch0, Box::new(|| {}))
    };
    assert!(matches!(err, Err(KpuError::BufferTooSmall { .. })));
}

#[test]
fn helpers_are_busy_while_a_task_runs() {
    let bench = Bench::new();
    let done = Arc::new(AtomicUsize::new(0));
    bench.kpu.run(counting_task(2, &done)).unwrap();

    let layer = LayerArgument::default();
    assert_eq!(bench.kpu.conv2d(&layer), Err(KpuError::Busy));
    let mut out_layer = LayerArgument::default();
    let mut dest = vec![0u64; 4];
    let err = unsafe {
        bench
            .kpu
            .conv2d_output(&mut out_layer, DmaChannel::Ch1, &mut dest, Box::new(|| {}))
    };
    assert_eq!(err, Err(KpuError::Busy));
}

fn counter_callback(counter: &Arc<AtomicUsize>) -> kpu::DmaCallback {
    let counter = counter.clone();
    Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn helper_transfer_holds_the_slot() {
    let bench = Bench::new();
    let helper = Arc::new(AtomicUsize::new(0));
    let mut layer = LayerArgument::default();
    layer.set_dma_total_byte(15);
    let mut dest = vec![0u64; 2];
    unsafe {
        bench
            .kpu
            .conv2d_output(&mut layer, DmaChannel::Ch5, &mut dest, counter_callback(&helper))
            .unwrap();
    }
    assert!(bench.kpu.is_busy());

    let done = Arc::new(AtomicUsize::new(0));
    let rejected = bench
        .kpu
        .run(counting_task(4, &done).with_source(source()))
        .unwrap_err();
    assert_eq!(rejected.error, KpuError::Busy);

    // The channel's completion belongs to the helper, not to a task.
    bench.kpu.on_dma_irq(DmaChannel::Ch5);
    assert_eq!(helper.load(Ordering::SeqCst), 1);
    assert_eq!(bench.kpu.state(), JobState::Idle);
    assert_eq!(bench.words().len(), LAYER_WORDS);
    assert!(!bench.kpu.is_busy());

    bench.kpu.run(rejected.into_inner()).unwrap();
    assert_eq!(bench.kpu.state(), JobState::InputTransfer);
}

#[test]
fn helpers_on_separate_channels_both_complete() {
    let bench = Bench::new();
    let input = Arc::new(AtomicUsize::new(0));
    let output = Arc::new(AtomicUsize::new(0));
    let layer = layers(1, 63).remove(0);
    let src = vec![1u8; 128];
    let mut out_layer = LayerArgument::default();
    let mut dest = vec![0u64; 1];

    unsafe {
        bench
            .kpu
            .input_dma(&layer, &src, DmaChannel::Ch0, counter_callback(&input))
            .unwrap();
        bench
            .kpu
            .conv2d_output(&mut out_layer, DmaChannel::Ch1, &mut dest, counter_callback(&output))
            .unwrap();
    }

    bench.kpu.on_dma_irq(DmaChannel::Ch0);
    assert_eq!(input.load(Ordering::SeqCst), 1);
    assert!(bench.kpu.is_busy());

    bench.kpu.on_dma_irq(DmaChannel::Ch1);
    assert_eq!(output.load(Ordering::SeqCst), 1);
    assert!(!bench.kpu.is_busy());
}

#[test]
fn one_helper_transfer_per_channel() {
    let bench = Bench::new();
    let first = Arc::new(AtomicUsize::new(0));
    let layer = layers(1, 63).remove(0);
    let src = vec![1u8; 128];
    unsafe {
        bench
            .kpu
            .input_dma(&layer, &src, DmaChannel::Ch2, counter_callback(&first))
            .unwrap();
        let again = bench
            .kpu
            .input_dma(&layer, &src, DmaChannel::Ch2, Box::new(|| {}));
        assert_eq!(again, Err(KpuError::Busy));
    }

    bench.kpu.on_dma_irq(DmaChannel::Ch2);
    assert_eq!(first.load(Ordering::SeqCst), 1);
}

#[test]
fn conv2d_holds_the_slot_until_calc_done() {
    let bench = Bench::new();
    let layer = layers(1, 63).remove(0);
    bench.kpu.conv2d(&layer).unwrap();
    assert!(bench.kpu.is_busy());

    let done = Arc::new(AtomicUsize::new(0));
    assert!(bench.kpu.run(counting_task(1, &done)).is_err());

    bench.raise(InterruptSources::CALC_DONE);
    assert!(!bench.kpu.is_busy());
    bench.kpu.run(counting_task(1, &done)).unwrap();
}

#[test]
fn busy_full_add_leaves_layer_untouched() {
    let bench = Bench::new();
    let done = Arc::new(AtomicUsize::new(0));
    bench.kpu.run(counting_task(2, &done)).unwrap();

    let mut layer = LayerArgument::default();
    layer.set_output_channels(4);
    let mut dest = vec![0u64; 4];
    let err = unsafe {
        bench
            .kpu
            .conv2d_output_full_add(&mut layer, DmaChannel::Ch1, &mut dest, Box::new(|| {}))
    };
    assert_eq!(err, Err(KpuError::Busy));
    assert_eq!(layer.interrupt_enable, 0);
    assert_eq!(layer.dma_parameter, 0);
}

type EagerKpu = Kpu<MockPort, EagerDmac, MockPlic>;

/// DMA controller whose transfers complete as soon as they are started,
/// raising the channel interrupt from inside the driver call.
struct EagerDmac {
    hw: Shared,
    kpu: Arc<OnceLock<Weak<EagerKpu>>>,
}

impl Dmac for EagerDmac {
    fn select_request(&mut self, channel: DmaChannel, request: DmaRequest) {
        self.hw.lock().ops.push(Op::Select(channel, request));
    }
    fn set_irq_enabled(&mut self, channel: DmaChannel, enabled: bool) {
        self.hw.lock().ops.push(Op::DmaIrq(channel, enabled));
    }
    fn clear_irq(&mut self, channel: DmaChannel) {
        self.hw.lock().ops.push(Op::DmaClear(channel));
    }
    fn set_single_mode(&mut self, channel: DmaChannel, transfer: &DmaTransfer) {
        self.hw.lock().ops.push(Op::Transfer(channel, *transfer));
        if let Some(kpu) = self.kpu.get().and_then(Weak::upgrade) {
            kpu.on_dma_irq(channel);
        }
    }
}

#[test]
fn interrupts_during_a_driver_call_are_deferred() {
    let _ = env_logger::builder().is_test(true).try_init();
    let hw = Shared::default();
    let handle = Arc::new(OnceLock::new());
    let kpu = Arc::new(
        Kpu::new(
            MockPort(hw.clone()),
            EagerDmac {
                hw: hw.clone(),
                kpu: handle.clone(),
            },
            MockPlic(hw.clone()),
            KpuConfig::default(),
        )
        .unwrap(),
    );
    let _ = handle.set(Arc::downgrade(&kpu));
    kpu.init(false, None);

    let done = Arc::new(AtomicUsize::new(0));
    kpu.run(counting_task(3, &done).with_source(source()))
        .unwrap();

    // Input landed and output drained while `run` still held the driver.
    assert_eq!(kpu.state(), JobState::BurstLoading);
    assert_eq!(kpu.remaining_layers(), 0);
    let words = hw
        .lock()
        .ops
        .iter()
        .filter(|op| matches!(op, Op::Word(_)))
        .count();
    assert_eq!(words, 3 * LAYER_WORDS);
    assert_eq!(done.load(Ordering::SeqCst), 0);

    hw.lock().pending.insert(InterruptSources::CALC_DONE);
    kpu.on_ai_irq();
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(!kpu.is_busy());
}
