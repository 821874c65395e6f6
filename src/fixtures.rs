//! Shared test programs and helpers.
//!
//! The corpus mirrors the models the checkers are exercised against: the
//! geometric counter in several truncated-subtraction variants, the bounded
//! retransmission protocol with and without a failure counter, the Rabin
//! mutual-exclusion draw and the rejection-sampling uniform generator.

#![allow(missing_docs)]

/// Counts coin flips until the first success.
pub const GEOMETRIC: &str = "
    nat c;
    nat f;

    while (f = 1) {
        { f := 0 } [0.5] { c := c + 1 }
    }
";

/// Geometric variant whose failure branch decrements, truncated at zero.
pub const GEOMETRIC_MONUS: &str = "
    nat c;
    nat f;

    while (f = 1) {
        { f := 0 } [0.5] { c := c - 1 }
    }
";

/// Truncation makes this one overshoot: from c = 0 the update lands on 2.
pub const GEOMETRIC_MONUS_BONUS: &str = "
    nat c;
    nat f;

    while (f = 1) {
        { f := 0 } [0.5] { c := c - 1 + 2 }
    }
";

/// Geometric behind a flag that flips every iteration.
pub const GEOMETRIC_FLIPPING: &str = "
    nat c;
    nat f;
    nat k;

    while (f = 1) {
        if (k = 0) {
            { f := 0 } [0.5] { c := c + 1 };
            k := 1
        } {
            k := 0
        }
    }
";

/// Bounded retransmission, four variables.
pub const BRP_SIMPLE: &str = "
    # The number of total packages to send
    nat toSend;

    # Number of packages sent
    nat sent;

    # The maximal number of retransmission tries
    nat maxFailed;

    # The number of failed retransmission tries
    nat failed;

    while (failed < maxFailed & sent < toSend) {
        {
            # Transmission of the current package succeeded
            failed := 0;
            sent := sent + 1;
        }
        [0.9]
        {
            # Transmission failed
            failed := failed + 1;
        }
    }
";

/// Bounded retransmission with a total-failure counter, five variables.
pub const BRP_TOTAL_FAILED: &str = "
    nat toSend;
    nat sent;
    nat maxFailed;
    nat failed;
    nat totalFailed;

    while (failed < maxFailed & sent < toSend) {
        {
            failed := 0;
            sent := sent + 1;
        }
        [0.9]
        {
            failed := failed + 1;
            totalFailed := totalFailed + 1;
        }
    }
";

/// Rabin's mutual-exclusion draw, inner loop unrolled into a phase variable.
pub const RABIN: &str = "
    nat i;
    nat n;
    nat d;
    nat phase;

    while (1 < i || phase = 1) {
        if (phase = 0) {
            n := i;
            phase := 1;
        } {
            if (0 < n) {
                { d := 0 } [0.5] { d := 1 };
                i := i - d;
                n := n - 1;
            } {
                phase := 0;
            }
        }
    }
";

/// Optimal discrete uniform generation over a window, by rejection sampling.
pub const UNIFORM_GENERATOR: &str = "
    nat elow;
    nat ehigh;  # Initially elow <= ehigh
    nat n;      # Initially ehigh - elow + 1
    nat v;      # Initially 1
    nat c;      # Initially 0; the result
    nat running;

    nat i;      # auxiliary index used by the specification

    while (running = 0) {
        v := 2*v;
        { c := 2*c + 1 } [0.5] { c := 2*c };
        if ((not (v < n))) {
            if ((not (n = c)) & (not (n < c))) {
                running := 1
            } {
                v := v - n;
                c := c - n;
            }
        } {
            skip
        }

        if ((not (running = 0))) {
            c := elow + c;
        } {
            skip
        }
    }
";

/// A geometric loop paying one tick per iteration, for runtime bounds.
pub const GEOMETRIC_TICK: &str = "
    nat c;
    nat f;

    while (f = 1) {
        { f := 0 } [0.5] { c := c + 1 };
        tick(1)
    }
";

/// Whether an SMT solver is reachable for end-to-end tests.
pub fn solver_available() -> bool {
    let command_line =
        std::env::var("PROBOUND_SOLVER").unwrap_or_else(|_| "z3 -in".to_string());
    let program = command_line.split_whitespace().next().unwrap_or("z3");
    std::process::Command::new(program)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok()
}
