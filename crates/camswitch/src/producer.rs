use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{select, tick, Receiver, Sender, TryRecvError};
use muxconfig::ProducerConfig;
use texmux::{Frame, FrameError, FrameSink, GpuResource, Transform};

const SINK_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Default)]
pub struct ProducerReport {
    pub frames_pushed: u64,
    pub closed_by_consumer: bool,
}

/// Synthetic camera: pushes a moving RGBA gradient into the resource's sink
/// at a fixed rate until stopped or until the resource is destroyed.
pub struct Producer {
    stop: Sender<()>,
    handle: JoinHandle<ProducerReport>,
}

impl Producer {
    pub fn spawn(resource: Arc<GpuResource>, config: &ProducerConfig) -> Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let interval = config.frame_interval();
        let (width, height) = (config.width, config.height);
        let handle = thread::Builder::new()
            .name("camswitch-producer".into())
            .spawn(move || {
                let Some(sink) = wait_for_sink(&resource, &stop_rx) else {
                    return ProducerReport::default();
                };
                tracing::debug!(
                    resource = resource.name(),
                    width,
                    height,
                    interval_ms = interval.as_secs_f64() * 1000.0,
                    "producer streaming"
                );
                stream(&sink, &stop_rx, interval, width, height)
            })
            .context("failed to spawn producer thread")?;
        Ok(Self {
            stop: stop_tx,
            handle,
        })
    }

    pub fn stop(self) -> Result<ProducerReport> {
        let _ = self.stop.try_send(());
        self.handle
            .join()
            .map_err(|_| anyhow!("producer thread panicked"))
    }
}

fn wait_for_sink(resource: &GpuResource, stop: &Receiver<()>) -> Option<FrameSink> {
    loop {
        match resource.sink_timeout(SINK_POLL) {
            Some(Ok(sink)) => return Some(sink),
            Some(Err(err)) => {
                tracing::debug!(%err, "resource gone before the first frame");
                return None;
            }
            None => {
                if !matches!(stop.try_recv(), Err(TryRecvError::Empty)) {
                    return None;
                }
            }
        }
    }
}

fn stream(
    sink: &FrameSink,
    stop: &Receiver<()>,
    interval: Duration,
    width: u32,
    height: u32,
) -> ProducerReport {
    let ticker = tick(interval);
    let orientation = Transform::flip_vertical();
    let mut report = ProducerReport::default();
    loop {
        select! {
            recv(stop) -> _ => return report,
            recv(ticker) -> _ => {
                let sequence = report.frames_pushed + 1;
                let frame = Frame::new(sequence, width, height)
                    .with_transform(orientation)
                    .with_pixels(gradient(sequence, width, height));
                match sink.push(frame) {
                    Ok(()) => report.frames_pushed = sequence,
                    Err(FrameError::Closed) => {
                        report.closed_by_consumer = true;
                        return report;
                    }
                    Err(err) => {
                        let _ = sink.report_error(err);
                    }
                }
            }
        }
    }
}

/// RGBA gradient that scrolls one column per frame.
pub fn gradient(sequence: u64, width: u32, height: u32) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);
    let shift = sequence as u32;
    for y in 0..height {
        for x in 0..width {
            let u = ((x + shift) % width) * 255 / width.max(1);
            let v = y * 255 / height.max(1);
            pixels.extend_from_slice(&[u as u8, v as u8, (sequence % 256) as u8, 255]);
        }
    }
    pixels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gradient_is_tightly_packed_rgba() {
        let pixels = gradient(3, 5, 2);
        assert_eq!(pixels.len(), 5 * 2 * 4);
        assert!(pixels.chunks(4).all(|px| px[3] == 255 && px[2] == 3));
        assert_ne!(gradient(1, 5, 2), gradient(2, 5, 2));
    }

    #[test]
    fn stops_without_a_created_resource() {
        let resource = Arc::new(GpuResource::new("camera"));
        let producer = Producer::spawn(resource, &ProducerConfig::default()).unwrap();
        let report = producer.stop().unwrap();
        assert_eq!(report.frames_pushed, 0);
    }

    #[test]
    fn exits_when_the_resource_is_destroyed() {
        let resource = Arc::new(GpuResource::new("camera"));
        let producer = Producer::spawn(Arc::clone(&resource), &ProducerConfig::default()).unwrap();
        resource.destroy(None).unwrap();
        let report = producer.stop().unwrap();
        assert_eq!(report.frames_pushed, 0);
    }
}
