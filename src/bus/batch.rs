use super::message::TransportMessage;

/// Size-bounded group of messages published in one broker call.
#[derive(Debug)]
pub struct MessageBatch {
    max_bytes: usize,
    size_bytes: usize,
    messages: Vec<TransportMessage>,
}

impl MessageBatch {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            size_bytes: 0,
            messages: Vec::new(),
        }
    }

    /// Hands the message back when it does not fit.
    pub fn try_add(&mut self, message: TransportMessage) -> Result<(), TransportMessage> {
        let size = message.encoded_size();
        if self.size_bytes + size > self.max_bytes {
            return Err(message);
        }
        self.size_bytes += size;
        self.messages.push(message);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn messages(&self) -> &[TransportMessage] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<TransportMessage> {
        self.messages
    }
}
