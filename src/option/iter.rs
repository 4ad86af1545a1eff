// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use super::*;
use crate::message::codec::decode_option;

/// A convenience iterator for parsing options from a byte buffer.
#[derive(Debug, Clone)]
pub struct OptionIterator<'a> {
    iter: core::slice::Iter<'a, u8>,
    last_option: OptionNumber,
    hit_payload_marker: bool,
}

impl<'a> Default for OptionIterator<'a> {
    fn default() -> Self {
        OptionIterator::new(&[])
    }
}

impl<'a> OptionIterator<'a> {
    /// Creates a new instance of an `OptionIterator` with the given byte slice.
    pub fn new(buffer: &'a [u8]) -> OptionIterator<'a> {
        OptionIterator {
            iter: buffer.iter(),
            last_option: Default::default(),
            hit_payload_marker: false,
        }
    }

    /// Returns the unread remainder of the buffer as a byte slice.
    ///
    /// Once the iterator has returned `None`, this is the message payload.
    pub fn as_slice(&self) -> &'a [u8] {
        self.iter.as_slice()
    }

    /// Returns true if iteration stopped because the payload marker (`0xFF`)
    /// was encountered, as opposed to running off the end of the buffer.
    pub fn hit_payload_marker(&self) -> bool {
        self.hit_payload_marker
    }

    /// Peek ahead to the next option without moving the iterator forward.
    pub fn peek(&self) -> Option<Result<(OptionNumber, &'a [u8]), Error>> {
        if self.iter.as_slice().first() == Some(&0xFF) {
            return None;
        }
        decode_option(&mut self.iter.clone(), self.last_option).transpose()
    }
}

impl<'a> Iterator for OptionIterator<'a> {
    type Item = Result<(OptionNumber, &'a [u8]), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.hit_payload_marker {
            return None;
        }
        if self.iter.as_slice().first() == Some(&0xFF) {
            self.iter.next();
            self.hit_payload_marker = true;
            return None;
        }
        let ret = decode_option(&mut self.iter, self.last_option).transpose();
        if let Some(Ok((key, _))) = ret {
            self.last_option = key;
        }
        ret
    }
}

impl AsRef<[u8]> for OptionIterator<'_> {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// Extension trait for option iterators that provides additional convenient accessors.
pub trait OptionIteratorExt<'a>: Iterator<Item = Result<(OptionNumber, &'a [u8]), Error>> {
    /// Moves the iterator forward until it finds a matching key or the
    /// spot where it should have been.
    ///
    /// If found, returns the option number and a byte slice of the value.
    ///
    /// Does not consume any options after the matching key.
    fn find_next(&mut self, key: OptionNumber) -> Option<Result<(OptionNumber, &'a [u8]), Error>>;

    /// Moves the iterator forward until it finds a matching key, returning
    /// the option value decoded as an unsigned integer.
    fn find_next_u32(&mut self, key: OptionNumber) -> Option<Result<u32, Error>> {
        match self.find_next(key)? {
            Ok((_, value)) => Some(try_decode_u32(value).ok_or(Error::ParseFailure)),
            Err(e) => Some(Err(e)),
        }
    }
}

impl<'a, I> OptionIteratorExt<'a> for I
where
    I: Iterator<Item = Result<(OptionNumber, &'a [u8]), Error>> + Sized + Clone,
{
    fn find_next(&mut self, key: OptionNumber) -> Option<Result<(OptionNumber, &'a [u8]), Error>> {
        let next_value = loop {
            let mut iter = self.clone();

            match iter.next()? {
                Err(x) => return Some(Err(x)),
                Ok((number, value)) => {
                    if number == key {
                        *self = iter;
                        break (key, value);
                    }
                    if number < key.0 {
                        *self = iter;
                        continue;
                    }
                }
            };

            return None;
        };

        Some(Ok(next_value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::codec::encode_option;

    fn option_buffer(options: &[(u16, &[u8])]) -> Vec<u8> {
        let mut buffer = vec![0u8; 256];
        let mut len = 0;
        let mut last = OptionNumber(0);
        for (key, value) in options {
            len += encode_option(&mut buffer[len..], last, OptionNumber(*key), value).unwrap();
            last = OptionNumber(*key);
        }
        buffer.truncate(len);
        buffer
    }

    #[test]
    fn iterates_in_order() {
        let buffer = option_buffer(&[(11, b"sensors"), (11, b"temp"), (12, &[]), (15, b"x=1")]);
        let decoded: Vec<(OptionNumber, &[u8])> = OptionIterator::new(&buffer)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            decoded,
            vec![
                (OptionNumber::URI_PATH, &b"sensors"[..]),
                (OptionNumber::URI_PATH, &b"temp"[..]),
                (OptionNumber::CONTENT_FORMAT, &b""[..]),
                (OptionNumber::URI_QUERY, &b"x=1"[..]),
            ]
        );
    }

    #[test]
    fn stops_at_payload_marker() {
        let mut buffer = option_buffer(&[(11, b"a")]);
        buffer.extend_from_slice(&[0xFF, b'h', b'i']);

        let mut iter = OptionIterator::new(&buffer);
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().is_none());
        assert!(iter.hit_payload_marker());
        assert_eq!(iter.as_slice(), b"hi");
    }

    #[test]
    fn find_next_skips_earlier_options() {
        let buffer = option_buffer(&[(4, b"\x01"), (11, b"x"), (14, b"\x3c")]);
        let mut iter = OptionIterator::new(&buffer);
        assert_eq!(
            iter.find_next_u32(OptionNumber::MAX_AGE),
            Some(Ok(60u32))
        );
        assert!(iter.find_next(OptionNumber::URI_PATH).is_none());
    }
}
