//! Session behavior against a recorded transport: write ordering, settle
//! delays, the state machine, and the error taxonomy. Runs on tokio's paused
//! clock so the device's one-second settle delays cost no wall time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use peacefair::error::Error;
use peacefair::pzem017::{InitialSettings, Pzem017, SessionState};
use peacefair::registers::ShuntType;
use peacefair::transport::{ReadFunction, RegisterTransport, TransportError};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Read { start: u16, count: u16, function: u8 },
    Write { address: u16, value: u16 },
    Command { function: u8 },
}

type Log = Arc<Mutex<Vec<(Instant, Call)>>>;

/// Plays back canned register blocks and records every transaction with a
/// timestamp from the (paused) tokio clock.
struct Playback {
    log: Log,
    measurement_words: Vec<u16>,
    config_words: Vec<u16>,
    // Absolute indices of transactions that should fail, counting every
    // read/write/command since construction.
    fail_at: Vec<usize>,
    calls: usize,
}

impl Playback {
    fn new() -> (Self, Log) {
        let log: Log = Arc::default();
        let t = Playback {
            log: log.clone(),
            measurement_words: vec![1550, 250, 388, 1200, 1, 0],
            config_words: vec![1520, 780, 1, 0x0000],
            fail_at: Vec::new(),
            calls: 0,
        };
        (t, log)
    }

    fn record(&mut self, call: Call) -> Result<(), TransportError> {
        self.log.lock().unwrap().push((Instant::now(), call));
        let index = self.calls;
        self.calls += 1;
        if self.fail_at.contains(&index) {
            Err(TransportError::Timeout(Duration::from_secs(1)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RegisterTransport for Playback {
    async fn read_registers(
        &mut self,
        start: u16,
        count: u16,
        function: ReadFunction,
    ) -> Result<Vec<u16>, TransportError> {
        self.record(Call::Read { start, count, function: function.code() })?;
        match function {
            ReadFunction::Input => Ok(self.measurement_words.clone()),
            ReadFunction::Holding => Ok(self.config_words.clone()),
        }
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), TransportError> {
        self.record(Call::Write { address, value })
    }

    async fn send_command(&mut self, function: u8) -> Result<(), TransportError> {
        self.record(Call::Command { function })
    }
}

fn settings() -> InitialSettings {
    InitialSettings { shunt: ShuntType::A100, low_volt_alarm: 7.8, high_volt_alarm: 15.2 }
}

async fn ready_session(transport: Playback) -> Pzem017<Playback> {
    let mut session = Pzem017::new(transport);
    session.initialize(&settings()).await.unwrap();
    session
}

fn calls(log: &Log) -> Vec<Call> {
    log.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
}

#[tokio::test(start_paused = true)]
async fn initialization_sequence_and_first_snapshots() {
    let (transport, log) = Playback::new();
    let session = ready_session(transport).await;

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(
        calls(&log),
        vec![
            Call::Write { address: 0x0000, value: 1520 },
            Call::Write { address: 0x0001, value: 780 },
            Call::Write { address: 0x0003, value: 0x0000 },
            Call::Read { start: 0x0000, count: 4, function: 0x03 },
            Call::Read { start: 0x0000, count: 6, function: 0x04 },
        ]
    );

    let m = session.last_measurements().unwrap();
    assert_eq!(m.voltage, 15.50);
    assert_eq!(m.current, 2.50);
    assert_eq!(m.power, 3.88);
    assert_eq!(m.energy, 12.00);
    assert!(m.high_volt_alarm_active);
    assert!(!m.low_volt_alarm_active);

    let c = session.last_configuration().unwrap();
    assert_eq!(c.high_volt_threshold, 15.20);
    assert_eq!(c.low_volt_threshold, 7.80);
    assert_eq!(c.slave_address, 1);
    assert_eq!(c.shunt_type, ShuntType::A100);
}

#[tokio::test(start_paused = true)]
async fn alarm_writes_are_high_then_low_with_settle_between() {
    let (transport, log) = Playback::new();
    let mut session = ready_session(transport).await;
    log.lock().unwrap().clear();

    session.set_alarm_thresholds(7.8, 15.0).await.unwrap();

    let recorded = log.lock().unwrap().clone();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0].1, Call::Write { address: 0x0000, value: 1500 });
    assert_eq!(recorded[1].1, Call::Write { address: 0x0001, value: 780 });
    // The settle delay between the two writes is mandatory.
    assert!(recorded[1].0 - recorded[0].0 >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn invalid_alarm_pair_issues_no_writes() {
    let (transport, log) = Playback::new();
    let mut session = ready_session(transport).await;
    log.lock().unwrap().clear();

    for (low, high) in [(7.0, 7.0), (10.0, 5.0), (0.5, 10.0), (10.0, 301.0)] {
        let err = session.set_alarm_thresholds(low, high).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }
    assert!(calls(&log).is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_second_threshold_write_is_a_partial_write() {
    let (mut transport, log) = Playback::new();
    // Initialization makes 5 transactions; the low-threshold write of the
    // following set_alarm_thresholds is number 6.
    transport.fail_at = vec![6];
    let mut session = ready_session(transport).await;
    log.lock().unwrap().clear();

    let err = session.set_alarm_thresholds(7.8, 15.0).await.unwrap_err();
    assert!(matches!(err, Error::PartialWrite { .. }));
    assert_eq!(calls(&log).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_first_threshold_write_is_a_clean_failure() {
    let (mut transport, log) = Playback::new();
    transport.fail_at = vec![5];
    let mut session = ready_session(transport).await;
    log.lock().unwrap().clear();

    let err = session.set_alarm_thresholds(7.8, 15.0).await.unwrap_err();
    assert!(matches!(err, Error::DeviceCommunication(_)));
    assert_eq!(calls(&log).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_shunt_is_rejected_before_any_transaction() {
    let (transport, log) = Playback::new();
    let mut session = ready_session(transport).await;
    log.lock().unwrap().clear();

    let err = session.set_shunt(ShuntType::Unknown(7)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert!("75A".parse::<ShuntType>().is_err());
    assert!(calls(&log).is_empty());
}

#[tokio::test(start_paused = true)]
async fn set_shunt_writes_the_shunt_register() {
    let (transport, log) = Playback::new();
    let mut session = ready_session(transport).await;
    log.lock().unwrap().clear();

    session.set_shunt(ShuntType::A300).await.unwrap();
    assert_eq!(calls(&log), vec![Call::Write { address: 0x0003, value: 0x0003 }]);
}

#[tokio::test(start_paused = true)]
async fn reset_energy_commands_waits_and_confirms() {
    let (transport, log) = Playback::new();
    let mut session = ready_session(transport).await;
    log.lock().unwrap().clear();

    session.reset_energy().await.unwrap();

    let recorded = log.lock().unwrap().clone();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0].1, Call::Command { function: 0x42 });
    assert_eq!(recorded[1].1, Call::Read { start: 0x0000, count: 4, function: 0x03 });
    // Per-write settle plus the longer reset settle before the meter is
    // spoken to again.
    assert!(recorded[1].0 - recorded[0].0 >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn reset_energy_surfaces_a_failed_confirmation_read() {
    let (mut transport, log) = Playback::new();
    // Initialization is transactions 0..=4; reset_energy issues the command
    // (5) and then the confirmation read (6). Fail the read.
    transport.fail_at = vec![6];
    let mut session = ready_session(transport).await;
    log.lock().unwrap().clear();

    let err = session.reset_energy().await.unwrap_err();
    assert!(matches!(err, Error::DeviceCommunication(_)));
    assert_eq!(calls(&log).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_initialization_is_terminal() {
    let (mut transport, log) = Playback::new();
    transport.fail_at = vec![0];
    let mut session = Pzem017::new(transport);

    let err = session.initialize(&settings()).await.unwrap_err();
    assert!(matches!(err, Error::DeviceCommunication(_)));
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(calls(&log).len(), 1);

    // Every operation now fails fast without touching the transport.
    assert!(matches!(
        session.read_measurements().await,
        Err(Error::SessionNotReady(SessionState::Failed))
    ));
    assert!(matches!(
        session.read_configuration().await,
        Err(Error::SessionNotReady(SessionState::Failed))
    ));
    assert!(matches!(
        session.set_alarm_thresholds(7.8, 15.0).await,
        Err(Error::SessionNotReady(SessionState::Failed))
    ));
    assert!(matches!(
        session.set_shunt(ShuntType::A100).await,
        Err(Error::SessionNotReady(SessionState::Failed))
    ));
    assert!(matches!(
        session.reset_energy().await,
        Err(Error::SessionNotReady(SessionState::Failed))
    ));
    assert!(matches!(
        session.initialize(&settings()).await,
        Err(Error::SessionNotReady(SessionState::Failed))
    ));
    assert_eq!(calls(&log).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn operations_before_initialization_fail_fast() {
    let (transport, log) = Playback::new();
    let mut session = Pzem017::new(transport);
    assert_eq!(session.state(), SessionState::Uninitialized);
    assert!(matches!(
        session.read_measurements().await,
        Err(Error::SessionNotReady(SessionState::Uninitialized))
    ));
    assert!(calls(&log).is_empty());
}

#[tokio::test(start_paused = true)]
async fn custom_settle_delays_are_honored() {
    let (transport, log) = Playback::new();
    let mut session = Pzem017::with_settle_delays(
        transport,
        Duration::from_millis(100),
        Duration::from_millis(400),
    );
    session.initialize(&settings()).await.unwrap();
    log.lock().unwrap().clear();

    session.reset_energy().await.unwrap();
    let recorded = log.lock().unwrap().clone();
    let gap = recorded[1].0 - recorded[0].0;
    assert!(gap >= Duration::from_millis(500));
    assert!(gap < Duration::from_secs(1));
}
