//! Fixed worker pool for thumbnail generation

use crossbeam_channel::{bounded, Sender};
use std::thread::JoinHandle;
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A small pool of worker threads fed through a short bounded queue.
///
/// The queue capacity is deliberately tiny: when all workers are busy the
/// producing pipeline thread blocks in [`WorkerPool::execute`] instead of
/// building an unbounded backlog of decoded image buffers.
pub struct WorkerPool {
	tx: Option<Sender<Job>>,
	workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
	pub fn new(name: &str) -> Self {
		Self::with_workers(name, (num_cpus::get() / 3).max(2))
	}

	pub fn with_workers(name: &str, count: usize) -> Self {
		let (tx, rx) = bounded::<Job>(2);
		let workers = (0..count.max(1))
			.map(|i| {
				let rx = rx.clone();
				std::thread::Builder::new()
					.name(format!("{name}-{i}"))
					.spawn(move || {
						for job in rx.iter() {
							job();
						}
					})
					.expect("failed to spawn worker thread")
			})
			.collect();
		debug!("worker pool '{name}' started with {count} threads");

		Self {
			tx: Some(tx),
			workers,
		}
	}

	/// Queue a job, blocking while the queue is full.
	pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
		if let Some(tx) = &self.tx {
			let _ = tx.send(Box::new(job));
		}
	}

	pub fn worker_count(&self) -> usize {
		self.workers.len()
	}
}

impl Drop for WorkerPool {
	fn drop(&mut self) {
		// closing the channel lets workers drain and exit
		self.tx.take();
		for handle in self.workers.drain(..) {
			let _ = handle.join();
		}
	}
}
