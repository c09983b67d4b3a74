//! Polyline encoding for route display.
//!
//! Implements the Google Polyline algorithm so couriers' map clients can draw
//! a sequenced route from a single string.
//! See: <https://developers.google.com/maps/documentation/utilities/polylinealgorithm>

use crate::domain::Coordinate;

/// Encodes coordinates with 5 decimal places of precision.
///
/// # Examples
///
/// ```
/// use courier_dispatch::domain::Coordinate;
/// use courier_dispatch::geometry::encode_polyline;
///
/// let line = encode_polyline(&[
///     Coordinate::new(38.5, -120.2),
///     Coordinate::new(40.7, -120.95),
///     Coordinate::new(43.252, -126.453),
/// ]);
/// assert_eq!(line, "_p~iF~ps|U_ulLnnqC_mqNvxq`@");
///
/// assert!(encode_polyline(&[]).is_empty());
/// ```
pub fn encode_polyline(coords: &[Coordinate]) -> String {
    let mut result = String::new();
    let mut prev = (0i64, 0i64);

    for c in coords {
        let lat_e5 = (c.lat * 1e5).round() as i64;
        let lng_e5 = (c.lng * 1e5).round() as i64;

        encode_value(lat_e5 - prev.0, &mut result);
        encode_value(lng_e5 - prev.1, &mut result);

        prev = (lat_e5, lng_e5);
    }

    result
}

fn encode_value(value: i64, output: &mut String) {
    let mut encoded = if value < 0 { !(value << 1) } else { value << 1 };

    // 5-bit chunks, 0x20 marks a continuation
    while encoded >= 0x20 {
        output.push((((encoded & 0x1f) | 0x20) as u8 + 63) as char);
        encoded >>= 5;
    }
    output.push((encoded as u8 + 63) as char);
}

/// Decodes a polyline back to coordinates.
///
/// ```
/// use courier_dispatch::geometry::decode_polyline;
///
/// let points = decode_polyline("_p~iF~ps|U_ulLnnqC_mqNvxq`@");
/// assert_eq!(points.len(), 3);
/// assert!((points[2].lng + 126.453).abs() < 1e-5);
/// ```
pub fn decode_polyline(encoded: &str) -> Vec<Coordinate> {
    let mut coords = Vec::new();
    let (mut lat, mut lng) = (0i64, 0i64);
    let bytes = encoded.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let (lat_delta, consumed) = decode_value(&bytes[i..]);
        i += consumed;
        if i >= bytes.len() {
            break;
        }
        let (lng_delta, consumed) = decode_value(&bytes[i..]);
        i += consumed;

        lat += lat_delta;
        lng += lng_delta;
        coords.push(Coordinate::new(lat as f64 / 1e5, lng as f64 / 1e5));
    }

    coords
}

fn decode_value(bytes: &[u8]) -> (i64, usize) {
    let mut result = 0i64;
    let mut shift = 0;
    let mut consumed = 0;

    for &b in bytes {
        consumed += 1;
        let chunk = (b as i64) - 63;
        result |= (chunk & 0x1f) << shift;
        shift += 5;
        if chunk < 0x20 {
            break;
        }
    }

    let value = if result & 1 != 0 { !(result >> 1) } else { result >> 1 };
    (value, consumed)
}

/// Polyline from `origin` through `stops` in visiting order.
pub fn route_polyline<'a, I>(origin: Coordinate, stops: I) -> String
where
    I: IntoIterator<Item = &'a Coordinate>,
{
    let coords: Vec<Coordinate> = std::iter::once(origin).chain(stops.into_iter().copied()).collect();
    encode_polyline(&coords)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_within_precision() {
        let coords = vec![
            Coordinate::new(25.03312, 121.56451),
            Coordinate::new(25.04781, 121.51701),
            Coordinate::new(24.99361, 121.30102),
        ];
        let decoded = decode_polyline(&encode_polyline(&coords));

        assert_eq!(decoded.len(), coords.len());
        for (orig, dec) in coords.iter().zip(&decoded) {
            assert!((orig.lat - dec.lat).abs() < 1e-5);
            assert!((orig.lng - dec.lng).abs() < 1e-5);
        }
    }

    #[test]
    fn test_route_polyline_starts_at_origin() {
        let origin = Coordinate::new(25.0, 121.5);
        let stops = [Coordinate::new(25.01, 121.51)];
        let decoded = decode_polyline(&route_polyline(origin, &stops));
        assert_eq!(decoded.len(), 2);
        assert!((decoded[0].lat - 25.0).abs() < 1e-5);
    }
}
