use encsched::{FrameInput, ImmediateFence, Session, SessionConfig};

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let text = std::fs::read_to_string(&path).unwrap_or_else(|e| {
                eprintln!("Failed to read {path}: {e}");
                std::process::exit(1);
            });
            serde_json::from_str(&text).unwrap_or_else(|e| {
                eprintln!("Invalid config {path}: {e}");
                std::process::exit(1);
            })
        }
        None => SessionConfig::default(),
    };

    let mut session = Session::new(config, ImmediateFence).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    let plan = session.plan();
    let walker = plan.walker();
    println!(
        "grid {}x{} blocks, degree {:?}, walker {}x{}",
        session.grid().width(),
        session.grid().height(),
        plan.degree(),
        walker.width,
        walker.height
    );
    for d in plan.scoreboard().deltas() {
        println!("  dependency ({:+}, {:+})", d.dx, d.dy);
    }
    for r in plan.regions() {
        println!(
            "  slice {} lane {:2}: start ({}, {}), diagonals {}..{}",
            r.slice_index,
            r.lane,
            r.start_x,
            r.start_y,
            r.diagonal_start,
            r.diagonal_start + r.diagonal_count
        );
    }
    println!("plan image: {} bytes", plan.to_bytes().len());

    let mut previous = None;
    for frame in 0..8 {
        let mut input = FrameInput::new(frame);
        if let Some(bits) = previous {
            input = input.with_previous(bits, 0);
        }
        let work = match session.submit_frame(input) {
            Ok(work) => work,
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        };
        println!(
            "frame {} slot {} {:?} qp {} target {} bits, {} tasks",
            work.frame_number,
            work.slot,
            work.decision.kind.frame_type,
            work.decision.qp,
            work.decision.target_bits,
            work.tasks.len()
        );
        previous = Some(work.decision.target_bits);
    }
}
