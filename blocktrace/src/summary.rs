//! Plain-text rendering of a reconstructed profile.

use std::io::{self, Write};
use std::time::Duration;

use reader::{Anchor, ProfileReport};

fn nanos(n: u64) -> String {
    humantime::format_duration(Duration::from_nanos(n)).to_string()
}

/// Write a per-thread overview followed by the `top` heaviest blocks of
/// each thread, ranked by total time.
pub fn write_summary(out: &mut impl Write, report: &ProfileReport, top: usize) -> io::Result<()> {
    writeln!(
        out,
        "process {} | span {} | {} thread(s), {} block(s)",
        report.dump.header.process_id,
        nanos(
            report
                .dump
                .header
                .end_time
                .saturating_sub(report.dump.header.begin_time)
        ),
        report.threads.len(),
        report.nodes.len(),
    )?;

    for thread in &report.threads {
        let name = if thread.name.is_empty() {
            "<unnamed>"
        } else {
            thread.name.as_str()
        };
        writeln!(
            out,
            "\nthread {} ({}): {} top-level, depth {}, active {}",
            thread.thread_id,
            name,
            thread.roots.len(),
            thread.max_depth,
            nanos(thread.active_time),
        )?;
        if !thread.events.is_empty() || !thread.context_switches.is_empty() {
            writeln!(
                out,
                "  {} event(s), {} value(s), {} context switch(es)",
                thread.events.len(),
                thread.values.len(),
                thread.context_switches.len(),
            )?;
        }

        let mut ranked: Vec<_> = report
            .dump
            .descriptors
            .iter()
            .filter_map(|d| {
                report
                    .stats
                    .lookup(d.id, Anchor::Thread(thread.thread_id))
                    .map(|s| (report.dump.arena.str_view(d.name), s))
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_duration.cmp(&a.1.total_duration));

        for (name, stats) in ranked.into_iter().take(top) {
            writeln!(
                out,
                "  {:<24} calls {:>6}  total {:>12}  avg {:>12}  min {:>12}  max {:>12}",
                name,
                stats.calls_number,
                nanos(stats.total_duration),
                nanos(stats.average_duration()),
                nanos(stats.min_duration),
                nanos(stats.max_duration),
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use profile_format::codec::{push_block_record, push_descriptor_record};
    use profile_format::{BlockKind, CaptureDump, FileHeader, THREAD_NAME_ID};
    use reader::build_report;
    use rstest::rstest;

    fn sample_report() -> ProfileReport {
        let mut descriptors = Vec::new();
        push_descriptor_record(&mut descriptors, 0, 1, 0, BlockKind::Block, true, "frame", "a.rs")
            .unwrap();
        push_descriptor_record(&mut descriptors, 1, 2, 0, BlockKind::Block, true, "physics", "a.rs")
            .unwrap();
        let mut blocks = Vec::new();
        push_block_record(&mut blocks, 0, 0, THREAD_NAME_ID, 7, b"render").unwrap();
        push_block_record(&mut blocks, 0, 1_000_000, 0, 7, b"").unwrap();
        push_block_record(&mut blocks, 100, 600_100, 1, 7, b"").unwrap();

        let mut dump = CaptureDump::new(FileHeader {
            process_id: 1234,
            begin_time: 0,
            end_time: 1_000_000,
            ..FileHeader::default()
        });
        dump.extend_descriptors(&descriptors).unwrap();
        dump.extend_records(&blocks).unwrap();
        build_report(dump)
    }

    #[rstest]
    fn test_summary_lists_threads_and_blocks() {
        let report = sample_report();
        let mut out = Vec::new();
        write_summary(&mut out, &report, 10).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("process 1234"));
        assert!(text.contains("thread 7 (render)"));
        assert!(text.contains("frame"));
        assert!(text.contains("physics"));
        // frame (1ms) outranks physics (600us)
        assert!(text.find("frame").unwrap() < text.find("physics").unwrap());
    }

    #[rstest]
    fn test_top_limit_truncates_ranking() {
        let report = sample_report();
        let mut out = Vec::new();
        write_summary(&mut out, &report, 1).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("frame"));
        assert!(!text.contains("physics"));
    }
}
