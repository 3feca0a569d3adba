//! Per-job мультиплексор вывода плейбука.
//!
//! Раннер публикует строки; любое число подписчиков получает их в порядке
//! публикации. Поздний подписчик сначала получает снапшот накопленного
//! буфера, затем живой поток; дедупликация на границе — по монотонному
//! индексу чанка. Медленный подписчик отбрасывается, раннер не ждёт никого.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::models::JobStatus;

/// Глубина широковещательного канала шины
const BUS_CAPACITY: usize = 1024;
/// Глубина буфера каждого подписчика
const SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum BusEvent {
    Chunk { index: u64, line: String },
    Closed { status: JobStatus },
}

struct BusState {
    buffer: Vec<String>,
    closed: Option<JobStatus>,
}

pub struct JobEventBus {
    job_id: i64,
    state: Mutex<BusState>,
    tx: broadcast::Sender<BusEvent>,
}

impl JobEventBus {
    fn new(job_id: i64) -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            job_id,
            state: Mutex::new(BusState {
                buffer: Vec::new(),
                closed: None,
            }),
            tx,
        }
    }

    /// Публикация чанка. Push в буфер и send выполняются под одним локом,
    /// чтобы подписка не могла потерять чанк между снапшотом и живым
    /// потоком. Никогда не блокирует дольше захвата мьютекса.
    pub fn publish(&self, line: &str) {
        let mut state = self.state.lock().expect("event bus mutex poisoned");
        if state.closed.is_some() {
            return;
        }
        let index = state.buffer.len() as u64;
        state.buffer.push(line.to_string());
        let _ = self.tx.send(BusEvent::Chunk {
            index,
            line: line.to_string(),
        });
    }

    /// Закрывает шину на терминальном статусе джобы. Идемпотентно.
    pub fn close(&self, status: JobStatus) {
        let mut state = self.state.lock().expect("event bus mutex poisoned");
        if state.closed.is_some() {
            return;
        }
        state.closed = Some(status);
        let _ = self.tx.send(BusEvent::Closed { status });
    }

    /// Снимок буфера на текущий момент
    pub fn snapshot(&self) -> (Vec<String>, Option<JobStatus>) {
        let state = self.state.lock().expect("event bus mutex poisoned");
        (state.buffer.clone(), state.closed)
    }

    /// Подписка: возвращает ограниченный канал, в который форвардер шлёт
    /// снапшот, затем живые события. Отписка в любой момент не влияет
    /// ни на других подписчиков, ни на раннер.
    pub fn subscribe(self: &Arc<Self>) -> mpsc::Receiver<BusEvent> {
        let (out_tx, out_rx) = mpsc::channel(SUBSCRIBER_CAPACITY);

        // Снапшот и broadcast-подписка берутся под одним локом: каждый
        // чанк попадёт либо в снапшот, либо в живой поток
        let (snapshot, closed, mut rx) = {
            let state = self.state.lock().expect("event bus mutex poisoned");
            (state.buffer.clone(), state.closed, self.tx.subscribe())
        };

        let job_id = self.job_id;
        tokio::spawn(async move {
            let snapshot_len = snapshot.len() as u64;
            for (index, line) in snapshot.into_iter().enumerate() {
                let event = BusEvent::Chunk {
                    index: index as u64,
                    line,
                };
                if out_tx.send(event).await.is_err() {
                    return;
                }
            }

            if let Some(status) = closed {
                let _ = out_tx.send(BusEvent::Closed { status }).await;
                return;
            }

            loop {
                match rx.recv().await {
                    Ok(BusEvent::Chunk { index, .. }) if index < snapshot_len => {
                        // Уже доставлен снапшотом
                        continue;
                    }
                    Ok(event @ BusEvent::Chunk { .. }) => {
                        if out_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(event @ BusEvent::Closed { .. }) => {
                        let _ = out_tx.send(event).await;
                        return;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(
                            "Dropping slow subscriber of job {} ({} chunks behind)",
                            job_id, missed
                        );
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        out_rx
    }
}

/// Реестр шин живых джоб. Шина создаётся при запуске операции и убирается
/// после закрытия; для завершённых джоб поток отдаётся из персистентного
/// буфера в сторе.
#[derive(Clone, Default)]
pub struct EventBusRegistry {
    inner: Arc<Mutex<HashMap<i64, Arc<JobEventBus>>>>,
}

impl EventBusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, job_id: i64) -> Arc<JobEventBus> {
        let bus = Arc::new(JobEventBus::new(job_id));
        self.inner
            .lock()
            .expect("registry mutex poisoned")
            .insert(job_id, bus.clone());
        bus
    }

    pub fn get(&self, job_id: i64) -> Option<Arc<JobEventBus>> {
        self.inner
            .lock()
            .expect("registry mutex poisoned")
            .get(&job_id)
            .cloned()
    }

    pub fn remove(&self, job_id: i64) {
        if self
            .inner
            .lock()
            .expect("registry mutex poisoned")
            .remove(&job_id)
            .is_some()
        {
            debug!("Garbage-collected event bus for job {}", job_id);
        }
    }
}
