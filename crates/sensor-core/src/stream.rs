//! A [`Stream`] is the public face of an event source: a control channel going
//! into the loop that owns the source, and a data channel coming out of it.
//!
//! The stream itself does nothing else. It doesn't buffer, filter or decode.
//! The owner is the only one allowed to close the data channel, which happens
//! implicitly when its [`StreamEnds::data`] sender is dropped. Consumers never
//! close anything: they stop reading and drop the handle.

use std::{error::Error, sync::Arc};

use tokio::sync::mpsc;

/// Error delivered on a data channel. It's reference counted so that the same
/// failure can be handed to every subscriber of a [`crate::Repeater`].
pub type StreamError = Arc<dyn Error + Send + Sync + 'static>;

/// Element of a sensor data channel: either a domain event or a pipeline error.
pub type Item<T> = Result<Arc<T>, StreamError>;

/// Consumer side of a control/data channel pair.
#[derive(Debug)]
pub struct Stream<C, T> {
    ctrl: mpsc::Sender<C>,
    data: mpsc::Receiver<T>,
}

/// Owner side of a control/data channel pair.
#[derive(Debug)]
pub struct StreamEnds<C, T> {
    pub ctrl: mpsc::Receiver<C>,
    pub data: mpsc::Sender<T>,
}

/// Create a linked [`Stream`] and [`StreamEnds`]. Both channels are bounded:
/// `ctrl_capacity` and `data_capacity` must be greater than zero.
pub fn channel<C, T>(ctrl_capacity: usize, data_capacity: usize) -> (Stream<C, T>, StreamEnds<C, T>) {
    let (tx_ctrl, rx_ctrl) = mpsc::channel(ctrl_capacity);
    let (tx_data, rx_data) = mpsc::channel(data_capacity);
    (
        Stream::new(tx_ctrl, rx_data),
        StreamEnds {
            ctrl: rx_ctrl,
            data: tx_data,
        },
    )
}

impl<C, T> Stream<C, T> {
    pub fn new(ctrl: mpsc::Sender<C>, data: mpsc::Receiver<T>) -> Self {
        Self { ctrl, data }
    }

    /// Receive the next item. `None` means the owner closed the data channel
    /// and nothing else will ever arrive.
    pub async fn recv(&mut self) -> Option<T> {
        self.data.recv().await
    }

    /// Send a control message to the owner of this stream.
    pub async fn control(&self, msg: C) -> Result<(), mpsc::error::SendError<C>> {
        self.ctrl.send(msg).await
    }
}
