macro_rules! ensure {
    ($cond:expr, $err:expr $(,)?) => {
        if !$cond {
            return std::result::Result::Err($err.into());
        }
    };
}

macro_rules! bail {
    ($err:expr $(,)?) => {{
        return std::result::Result::Err($err.into());
    }};
}

/// A wrapper around `&[u8]` that implements [`std::fmt::Display`] in a more intelligent way.
pub struct DisplayBytes<'a>(pub &'a [u8]);

impl std::fmt::Display for DisplayBytes<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let string = match std::str::from_utf8(self.0) {
            Ok(string) => string,
            Err(_) => {
                return f.write_fmt(format_args!("<{} bytes>", self.0.len()));
            },
        };

        match string.parse::<serde_json::Value>() {
            Ok(serde_json::Value::Object(map)) => {
                if map.len() == 1 {
                    return f.write_fmt(format_args!(
                        "<JSON dict with key '{}'>",
                        map.keys().next().unwrap()
                    ));
                } else if map.contains_key("type") {
                    return f.write_fmt(format_args!(
                        "<JSON dict of type '{}'>",
                        map.get("type").unwrap()
                    ));
                } else {
                    return f.write_fmt(format_args!("<JSON dict with {} keys>", map.len()));
                }
            },
            Ok(serde_json::Value::Array(list)) => {
                return f.write_fmt(format_args!("<JSON array with {} entry/ies>", list.len()));
            },
            _ => (),
        }

        if string.len() > 20 {
            f.write_fmt(format_args!("\"{:.15}…\"", string.replace('"', "\\\"")))?;
        } else {
            f.write_fmt(format_args!("\"{}\"", string.replace('"', "\\\"")))?;
        }

        Ok(())
    }
}

/// Treat the slice as a big-endian integer and add one to it, wrapping around
/// on overflow. The record layer uses this for its receive nonce counter.
pub fn increment_be(n: &mut [u8]) {
    let mut c = 1u16;
    for b in n.iter_mut().rev() {
        c += *b as u16;
        *b = c as u8;
        c >>= 8;
    }
}

pub async fn timeout<F, T>(
    duration: std::time::Duration,
    future: F,
) -> Result<T, async_std::future::TimeoutError>
where
    F: futures::Future<Output = T>,
{
    async_std::future::timeout(duration, future).await
}
