//! Geographic coordinates and nearest-populated-place matching

use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoCoordinate {
	pub latitude: f64,
	pub longitude: f64,
}

impl GeoCoordinate {
	/// Exactly 0.0 is treated as invalid: cameras without a fix write
	/// zeroed coordinates far more often than photos are taken on the
	/// equator or prime meridian.
	pub fn validate(value: f64) -> bool {
		value.is_finite() && value != 0.0
	}

	pub fn is_valid(&self) -> bool {
		Self::validate(self.latitude) && Self::validate(self.longitude)
	}

	/// Great-circle distance in meters.
	pub fn distance_to(&self, other: &GeoCoordinate) -> f64 {
		let d1 = self.latitude * (std::f64::consts::PI / 180.0);
		let num1 = self.longitude * (std::f64::consts::PI / 180.0);
		let d2 = other.latitude * (std::f64::consts::PI / 180.0);
		let num2 = other.longitude * (std::f64::consts::PI / 180.0) - num1;
		let d3 = ((d2 - d1) / 2.0).sin().powi(2)
			+ d1.cos() * d2.cos() * (num2 / 2.0).sin().powi(2);

		6_376_500.0 * (2.0 * d3.sqrt().atan2((1.0 - d3).sqrt()))
	}
}

/// A populated place from the built-in table. The radius roughly captures
/// the urban extent so that large cities win over nearby small towns.
#[derive(Debug, Clone)]
pub struct Place {
	pub coord: GeoCoordinate,
	pub country: String,
	pub name: String,
	pub radius_m: f64,
}

static PLACES: LazyLock<Vec<Place>> = LazyLock::new(|| {
	include_str!("../data/places.tsv")
		.lines()
		.filter(|line| !line.is_empty() && !line.starts_with('#'))
		.filter_map(|line| {
			let mut parts = line.split('\t');
			let latitude: f64 = parts.next()?.parse().ok()?;
			let longitude: f64 = parts.next()?.parse().ok()?;
			let country = parts.next()?.to_string();
			let name = parts.next()?.to_string();
			let radius_m: f64 = parts.next()?.parse().ok()?;
			Some(Place {
				coord: GeoCoordinate {
					latitude,
					longitude,
				},
				country,
				name,
				radius_m,
			})
		})
		.collect()
});

/// The place whose center-minus-radius is nearest to the coordinate.
pub fn nearest_place(coord: &GeoCoordinate) -> Option<&'static Place> {
	PLACES.iter().min_by(|a, b| {
		let da = coord.distance_to(&a.coord) - a.radius_m;
		let db = coord.distance_to(&b.coord) - b.radius_m;
		da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_validate() {
		assert!(GeoCoordinate::validate(37.0));
		assert!(GeoCoordinate::validate(-122.0));
		assert!(!GeoCoordinate::validate(0.0));
		assert!(!GeoCoordinate::validate(f64::NAN));
		assert!(!GeoCoordinate::validate(f64::INFINITY));
	}

	#[test]
	fn test_distance_sanity() {
		let paris = GeoCoordinate {
			latitude: 48.8566,
			longitude: 2.3522,
		};
		let london = GeoCoordinate {
			latitude: 51.5074,
			longitude: -0.1278,
		};

		let d = paris.distance_to(&london);
		// roughly 344 km
		assert!(d > 330_000.0 && d < 360_000.0, "got {d}");
		assert!(paris.distance_to(&paris) < 1.0);
	}

	#[test]
	fn test_nearest_place() {
		// close to San Francisco
		let coord = GeoCoordinate {
			latitude: 37.7,
			longitude: -122.4,
		};
		let place = nearest_place(&coord).unwrap();
		assert_eq!(place.name, "San Francisco");
		assert_eq!(place.country, "United States");
	}

	#[test]
	fn test_places_table_parses() {
		assert!(PLACES.len() > 30);
		for place in PLACES.iter() {
			assert!(place.coord.is_valid(), "bad coords for {}", place.name);
			assert!(place.radius_m > 0.0);
		}
	}
}
