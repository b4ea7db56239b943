use crate::error::{DartError, DartResult};
use crate::transport::{AmHandler, AmId, CommAm};

use super::fabric::AmEnvelope;
use super::LocalComm;

use std::sync::atomic::Ordering;

impl CommAm for LocalComm {
    fn register_handler(&self, id: AmId, handler: AmHandler) {
        self.handlers.write().insert(id, handler);
    }

    fn request_send(&self, unit: usize, id: AmId, payload: Vec<u8>) -> DartResult<()> {
        if unit >= self.num_units {
            return Err(DartError::Inval);
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        let envelope = AmEnvelope {
            src: self.my_unit,
            id,
            payload,
        };
        if self.fabric.send(unit, envelope) {
            Ok(())
        } else {
            tracing::error!("unit {} inbox of unit {} is closed", self.my_unit, unit);
            Err(DartError::Other)
        }
    }

    fn progress(&self) -> usize {
        //only one thread drains the inbox at a time, keeping handlers of a unit serialized
        let _guard = match self.progress_lock.try_lock() {
            Some(guard) => guard,
            None => return 0,
        };
        let mut cnt = 0;
        while let Ok(envelope) = self.fabric.inbox(self.my_unit).try_recv() {
            let handler = self.handlers.read().get(&envelope.id).cloned();
            match handler {
                Some(handler) => handler(envelope.src, &envelope.payload),
                None => tracing::error!(
                    "unit {} dropping message {} from unit {}: no handler registered",
                    self.my_unit,
                    envelope.id,
                    envelope.src
                ),
            }
            self.handled.fetch_add(1, Ordering::SeqCst);
            cnt += 1;
        }
        cnt
    }

    fn am_counts(&self) -> (u64, u64) {
        (
            self.sent.load(Ordering::SeqCst),
            self.handled.load(Ordering::SeqCst),
        )
    }
}
