//! `zones` subcommand: edit the zone file used by `monitor --zones`.

use std::path::Path;

use anyhow::{Result, bail};
use vision::ZoneBook;

use crate::cli::{ZoneAction, ZonesArgs};

pub fn run(args: ZonesArgs) -> Result<()> {
    let output = apply(&args.file, args.action)?;
    print!("{output}");
    Ok(())
}

/// Apply `action` to the file at `path` and return what to print.
pub(crate) fn apply(path: &Path, action: ZoneAction) -> Result<String> {
    let mut book = if path.exists() {
        ZoneBook::load(path)?
    } else {
        ZoneBook::new()
    };

    match action {
        ZoneAction::List => Ok(render(&book)),
        ZoneAction::Add {
            source,
            name,
            points,
            scale,
            frame,
        } => {
            if !(scale.is_finite() && scale > 0.0) {
                bail!("--scale must be a positive number");
            }
            let name = match frame {
                Some(frame) => book.add_display_polygon(&source, &name, &points, scale, frame)?,
                None => {
                    let points = points
                        .iter()
                        .map(|&(x, y)| {
                            let (x, y) = (x / scale, y / scale);
                            [x.round_ties_even() as i32, y.round_ties_even() as i32]
                        })
                        .collect();
                    book.add_polygon(&source, &name, points)?
                }
            };
            book.save(path)?;
            Ok(format!("added polygon to {source}/{name}\n"))
        }
        ZoneAction::Remove { source, name } => {
            if !book.remove_zone(&source, &name) {
                bail!("no zone {name:?} for source {source:?}");
            }
            book.save(path)?;
            Ok(format!("removed {source}/{name}\n"))
        }
        ZoneAction::Clear { source } => {
            book.clear(&source);
            book.save(path)?;
            Ok(format!("cleared zones of {source}\n"))
        }
    }
}

fn render(book: &ZoneBook) -> String {
    let mut out = String::new();
    for source in book.sources() {
        let Some(zones) = book.zones(source) else {
            continue;
        };
        out.push_str(source);
        out.push('\n');
        for (name, polygons) in zones {
            out.push_str(&format!("  {name}: {} polygon(s)\n", polygons.len()));
            for polygon in polygons {
                let points: Vec<String> = polygon
                    .points()
                    .iter()
                    .map(|[x, y]| format!("({x},{y})"))
                    .collect();
                out.push_str(&format!("    {}\n", points.join(" ")));
            }
        }
    }
    if out.is_empty() {
        out.push_str("no zones\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(source: &str, name: &str, points: &[(f64, f64)]) -> ZoneAction {
        ZoneAction::Add {
            source: source.into(),
            name: name.into(),
            points: points.to_vec(),
            scale: 1.0,
            frame: None,
        }
    }

    #[test]
    fn add_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zones.json");

        let square = [(0.0, 0.0), (100.0, 0.0), (100.0, 100.0), (0.0, 100.0)];
        let out = apply(&path, add("cam", "cocina", &square)).unwrap();
        assert_eq!(out, "added polygon to cam/cocina\n");

        let listing = apply(&path, ZoneAction::List).unwrap();
        assert!(listing.starts_with("cam\n  cocina: 1 polygon(s)\n"));
        assert!(listing.contains("(100,100)"));

        apply(
            &path,
            ZoneAction::Remove {
                source: "cam".into(),
                name: "cocina".into(),
            },
        )
        .unwrap();
        assert_eq!(apply(&path, ZoneAction::List).unwrap(), "no zones\n");
    }

    #[test]
    fn invalid_edits_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zones.json");

        assert!(apply(&path, add("cam", "pasillo", &[(0.0, 0.0), (5.0, 5.0)])).is_err());
        assert!(!path.exists());

        let missing = ZoneAction::Remove {
            source: "cam".into(),
            name: "nada".into(),
        };
        assert!(apply(&path, missing).is_err());
    }

    #[test]
    fn display_points_are_scaled_into_the_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zones.json");
        let action = ZoneAction::Add {
            source: "cam".into(),
            name: "sala".into(),
            points: vec![(0.0, 0.0), (50.0, 0.0), (50.0, 400.0)],
            scale: 0.5,
            frame: Some((640, 480)),
        };
        apply(&path, action).unwrap();
        let book = ZoneBook::load(&path).unwrap();
        let polygon = &book.zones("cam").unwrap()["sala"][0];
        assert_eq!(polygon.points(), &[[0, 0], [100, 0], [100, 479]]);
    }
}
