use crate::model::LatLng;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters.
pub fn haversine_m(a: LatLng, b: LatLng) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

pub fn haversine_km(a: LatLng, b: LatLng) -> f64 {
    haversine_m(a, b) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance_for_identical_points() {
        let p = LatLng {
            lat: 13.7563,
            lng: 100.5018,
        };
        assert!(haversine_m(p, p) < 1e-9);
    }

    #[test]
    fn bangkok_to_nakhon_ratchasima_is_about_180_km() {
        let bangkok = LatLng {
            lat: 13.7563,
            lng: 100.5018,
        };
        let korat = LatLng {
            lat: 14.9799,
            lng: 102.0978,
        };
        let km = haversine_km(bangkok, korat);
        assert!((170.0..240.0).contains(&km), "got {km}");
    }

    #[test]
    fn fifty_meter_drift_is_resolvable() {
        let a = LatLng {
            lat: 13.94551,
            lng: 100.73405,
        };
        // ~55 m north.
        let b = LatLng {
            lat: 13.94601,
            lng: 100.73405,
        };
        let d = haversine_m(a, b);
        assert!((40.0..70.0).contains(&d), "got {d}");
    }
}
