use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError},
    },
    time::Duration,
};

/// Raw input handed to an encoder.
pub enum RawFrame {
    Video(RawVideoFrame),
    Audio(PcmBuffer),
}

pub struct RawVideoFrame {
    frame: ffmpeg_next::frame::Video,
}

impl RawVideoFrame {
    pub fn width(&self) -> u32 {
        self.frame.width()
    }

    pub fn height(&self) -> u32 {
        self.frame.height()
    }

    pub fn format(&self) -> ffmpeg_next::format::Pixel {
        self.frame.format()
    }

    /// Presentation time in microseconds, stamped by the capture source.
    pub fn pts(&self) -> Option<i64> {
        self.frame.pts()
    }

    pub fn set_pts(&mut self, pts: i64) {
        self.frame.set_pts(Some(pts));
    }

    pub fn as_video(&self) -> &ffmpeg_next::frame::Video {
        &self.frame
    }

    pub fn get_mut(&mut self) -> &mut ffmpeg_next::frame::Video {
        &mut self.frame
    }
}

impl From<ffmpeg_next::frame::Video> for RawVideoFrame {
    fn from(frame: ffmpeg_next::frame::Video) -> Self {
        Self { frame }
    }
}

/// Interleaved signed 16-bit PCM as read from an audio source.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    pub samples: Vec<i16>,
    pub channels: u16,
    pub sample_rate: u32,
    /// Capture time of the first sample, in microseconds.
    pub pts: i64,
}

impl PcmBuffer {
    /// Number of samples per channel.
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Decodes little-endian s16 bytes as delivered by PCM capture devices.
    pub fn from_le_bytes(data: &[u8], channels: u16, sample_rate: u32, pts: i64) -> Self {
        let samples = data
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self {
            samples,
            channels,
            sample_rate,
            pts,
        }
    }
}

/// Producer side of an encoder's input queue.
///
/// For a surface-fed encoder the capture source owns the only handle and
/// dropping it severs the input. For a buffer-fed encoder the feed thread
/// queues buffers and the controller signals end of stream explicitly.
#[derive(Clone)]
pub struct EncoderInput {
    tx: SyncSender<RawFrame>,
    end_of_stream: Arc<AtomicBool>,
}

impl EncoderInput {
    pub fn channel(capacity: usize) -> (EncoderInput, InputQueue) {
        let (tx, rx) = std::sync::mpsc::sync_channel(capacity.max(1));
        let end_of_stream = Arc::new(AtomicBool::new(false));
        (
            EncoderInput {
                tx,
                end_of_stream: end_of_stream.clone(),
            },
            InputQueue { rx, end_of_stream },
        )
    }

    /// Queues a frame without blocking. Returns `Ok(false)` when the queue is
    /// full and the frame was dropped.
    pub fn try_queue(&self, frame: RawFrame) -> anyhow::Result<bool> {
        if self.end_of_stream.load(Ordering::Acquire) {
            return Ok(false);
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Disconnected(_)) => Err(anyhow::anyhow!("encoder input closed")),
        }
    }

    /// Marks the input finished; the encoder flushes once the queue is empty.
    pub fn signal_end_of_stream(&self) {
        self.end_of_stream.store(true, Ordering::Release);
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream.load(Ordering::Acquire)
    }

    /// A handle that can end the stream without keeping the queue open.
    pub fn end_of_stream_flag(&self) -> EndOfStreamFlag {
        EndOfStreamFlag(self.end_of_stream.clone())
    }
}

/// Ends an encoder's input: queued frames are still handed out, new ones are
/// refused.
#[derive(Debug, Clone)]
pub struct EndOfStreamFlag(Arc<AtomicBool>);

impl EndOfStreamFlag {
    pub fn signal(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_signalled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub enum InputEvent {
    Frame(RawFrame),
    Idle,
    EndOfStream,
}

impl std::fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawFrame::Video(frame) => write!(
                f,
                "Video({}x{}, pts: {:?})",
                frame.width(),
                frame.height(),
                frame.pts()
            ),
            RawFrame::Audio(buffer) => write!(
                f,
                "Audio({} frames, pts: {})",
                buffer.frames(),
                buffer.pts
            ),
        }
    }
}

/// Consumer side of an encoder's input queue, owned by the encoder capability.
pub struct InputQueue {
    rx: Receiver<RawFrame>,
    end_of_stream: Arc<AtomicBool>,
}

impl InputQueue {
    /// Waits up to `timeout` for the next input. End of stream is only
    /// reported once every queued frame has been handed out.
    pub fn next(&self, timeout: Duration) -> InputEvent {
        match self.rx.try_recv() {
            Ok(frame) => return InputEvent::Frame(frame),
            Err(std::sync::mpsc::TryRecvError::Disconnected) => return InputEvent::EndOfStream,
            Err(std::sync::mpsc::TryRecvError::Empty) => {}
        }
        if self.end_of_stream.load(Ordering::Acquire) {
            return InputEvent::EndOfStream;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => InputEvent::Frame(frame),
            Err(RecvTimeoutError::Timeout) => {
                if self.end_of_stream.load(Ordering::Acquire) {
                    InputEvent::EndOfStream
                } else {
                    InputEvent::Idle
                }
            }
            Err(RecvTimeoutError::Disconnected) => InputEvent::EndOfStream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(pts: i64) -> RawFrame {
        RawFrame::Audio(PcmBuffer {
            samples: vec![0; 2048],
            channels: 2,
            sample_rate: 44_100,
            pts,
        })
    }

    #[test]
    fn test_queue_drains_before_end_of_stream() {
        let (input, queue) = EncoderInput::channel(4);
        assert!(input.try_queue(pcm(1)).unwrap());
        assert!(input.try_queue(pcm(2)).unwrap());
        input.signal_end_of_stream();

        assert!(matches!(queue.next(Duration::from_millis(1)), InputEvent::Frame(_)));
        assert!(matches!(queue.next(Duration::from_millis(1)), InputEvent::Frame(_)));
        assert!(matches!(
            queue.next(Duration::from_millis(1)),
            InputEvent::EndOfStream
        ));
    }

    #[test]
    fn test_full_queue_drops_instead_of_blocking() {
        let (input, _queue) = EncoderInput::channel(1);
        assert!(input.try_queue(pcm(1)).unwrap());
        assert!(!input.try_queue(pcm(2)).unwrap());
    }

    #[test]
    fn test_dropping_the_surface_ends_the_stream() {
        let (input, queue) = EncoderInput::channel(2);
        assert!(matches!(queue.next(Duration::from_millis(1)), InputEvent::Idle));
        drop(input);
        assert!(matches!(
            queue.next(Duration::from_millis(1)),
            InputEvent::EndOfStream
        ));
    }

    #[test]
    fn test_end_of_stream_flag_refuses_new_frames() {
        let (input, queue) = EncoderInput::channel(4);
        let flag = input.end_of_stream_flag();
        assert!(input.try_queue(pcm(1)).unwrap());
        flag.signal();

        assert!(input.is_end_of_stream());
        assert!(!input.try_queue(pcm(2)).unwrap());
        assert!(matches!(queue.next(Duration::from_millis(1)), InputEvent::Frame(_)));
        assert!(matches!(
            queue.next(Duration::from_millis(1)),
            InputEvent::EndOfStream
        ));
    }

    #[test]
    fn test_flag_does_not_keep_the_surface_open() {
        let (input, queue) = EncoderInput::channel(2);
        let flag = input.end_of_stream_flag();
        drop(input);
        assert!(!flag.is_signalled());
        assert!(matches!(
            queue.next(Duration::from_millis(1)),
            InputEvent::EndOfStream
        ));
    }

    #[test]
    fn test_pcm_from_le_bytes() {
        let buffer = PcmBuffer::from_le_bytes(&[0x01, 0x00, 0xff, 0xff, 0x00, 0x80], 1, 8_000, 5);
        assert_eq!(buffer.samples, vec![1, -1, i16::MIN]);
        assert_eq!(buffer.frames(), 3);
    }
}
